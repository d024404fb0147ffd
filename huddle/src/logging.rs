use std::fs::{File, OpenOptions};
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Crates of the WebRTC stack that log every ICE check and DTLS record.
/// They stay at `warn` unless the configured level is more verbose than `debug`.
const MEDIA_STACK_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_srtp",
    "webrtc_sctp",
    "webrtc_mdns",
    "webrtc_data",
    "interceptor",
    "turn",
    "stun",
];

/// Install the global subscriber.
///
/// `RUST_LOG` replaces the whole filter when set. Otherwise the configured
/// level applies to huddle and the media stack is quieted.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));
    let file = config.file_path.as_deref().map(open_log_file).transpose()?;
    let registry = tracing_subscriber::registry().with(filter);

    match (config.format.as_str(), file) {
        ("json", file) => {
            let layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true)
                .with_line_number(true);
            match file {
                Some(file) => registry.with(layer.with_writer(file)).init(),
                None => registry.with(layer).init(),
            }
        }
        (_, Some(file)) => {
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(file);
            registry.with(layer).init();
        }
        (_, None) => {
            let layer = fmt::layer()
                .pretty()
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .with_file(false);
            registry.with(layer).init();
        }
    }

    Ok(())
}

fn default_filter(level: Level) -> EnvFilter {
    let media_level = if level == Level::TRACE {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    MEDIA_STACK_TARGETS
        .iter()
        .fold(EnvFilter::new(LevelFilter::from_level(level).to_string()), |filter, target| {
            match format!("{target}={media_level}").parse() {
                Ok(directive) => filter.add_directive(directive),
                Err(_) => filter,
            }
        })
}

fn open_log_file(path: &str) -> anyhow::Result<Arc<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open log file {path}: {e}"))?;
    Ok(Arc::new(file))
}

/// Parse log level string to tracing Level
pub(crate) fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("info").unwrap(), Level::INFO);
        assert_eq!(parse_log_level("warning").unwrap(), Level::WARN);
        assert_eq!(parse_log_level("error").unwrap(), Level::ERROR);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_default_filter_quiets_media_stack() {
        let filter = default_filter(Level::DEBUG).to_string();
        assert!(filter.contains("webrtc_ice=warn"));
        assert!(filter.contains("interceptor=warn"));
        assert!(filter.contains("debug"));

        let verbose = default_filter(Level::TRACE).to_string();
        assert!(verbose.contains("webrtc_dtls=debug"));
    }

    #[test]
    fn test_open_log_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huddle.log");
        let path = path.to_str().unwrap();
        std::fs::write(path, "existing\n").unwrap();

        let file = open_log_file(path).unwrap();
        std::io::Write::write_all(&mut &*file, b"appended\n").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "existing\nappended\n");

        assert!(open_log_file("/nonexistent/dir/huddle.log").is_err());
    }
}
