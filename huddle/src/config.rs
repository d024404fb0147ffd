use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use huddle_sfu::SfuConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "HUDDLE_CONFIG_PATH";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: SfuConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How often rooms without members are closed
    pub janitor_interval_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            janitor_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (`HUDDLE_SERVER__PORT`, `HUDDLE_SFU__SLOT_POOL_SIZE`, ...)
    /// 2. Config file (if provided)
    /// 3. Defaults
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("HUDDLE")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("sfu.stun_servers")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check the whole configuration, collecting every problem
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.server.host.is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.server.janitor_interval_seconds == 0 {
            errors.push("server.janitor_interval_seconds must be greater than 0".to_string());
        }
        if let Err(e) = crate::logging::parse_log_level(&self.logging.level) {
            errors.push(format!("logging.level: {e}"));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }
        if let Err(sfu_errors) = self.sfu.validate() {
            errors.extend(sfu_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Find and load the configuration.
///
/// File lookup order: `explicit`, `HUDDLE_CONFIG_PATH`, `./config.yaml`,
/// `/config/config.yaml`. Without a file only environment variables and
/// defaults apply.
pub fn load_config(explicit: Option<&str>) -> anyhow::Result<Config> {
    let config_path = explicit
        .map(str::to_string)
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            std::env::var(CONFIG_PATH_ENV)
                .ok()
                .filter(|p| Path::new(p).exists())
        })
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| Path::new(p).exists())
                .map(str::to_string)
        });

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load config from {path}: {e}"))?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env()?
    };

    info!("Configuration loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_sfu::OverflowPolicy;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.sfu.slot_pool_size, 8);
        assert_eq!(config.http_address(), "0.0.0.0:8080");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        write!(
            file,
            r#"
server:
  port: 9000
logging:
  format: json
sfu:
  slot_pool_size: 4
  stun_servers:
    - "stun:stun.example.com:3478"
  send_queue:
    capacity: 16
    overflow: drop_oldest
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap();
        let config = Config::from_file(path).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.sfu.slot_pool_size, 4);
        assert_eq!(config.sfu.stun_servers, vec!["stun:stun.example.com:3478"]);
        assert_eq!(config.sfu.send_queue.capacity, 16);
        assert_eq!(config.sfu.send_queue.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.sfu.event_queue.capacity, 64);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load(Some("/nonexistent/huddle.yaml")).unwrap();
        assert_eq!(config.sfu.detector_margin, 5);
    }

    #[test]
    fn test_validate_collects_errors() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        config.sfu.slot_pool_size = 0;
        config.server.janitor_interval_seconds = 0;
        config.logging.level = "loud".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
    }
}
