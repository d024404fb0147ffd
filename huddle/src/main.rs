mod config;
mod logging;
mod server;
mod ws;

use anyhow::Result;
use clap::Parser;
use huddle_sfu::Hub;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "huddle")]
#[command(about = "Huddle group-call SFU", long_about = None)]
struct Args {
    /// Path to a YAML/TOML/JSON config file
    #[arg(short, long, env = "HUDDLE_CONFIG_PATH")]
    config: Option<String>,

    /// HTTP listen host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// HTTP listen port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = config::load_config(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Huddle SFU starting...");
    info!("HTTP address: {}", config.http_address());
    info!(
        slot_pool_size = config.sfu.slot_pool_size,
        stun_servers = config.sfu.stun_servers.len(),
        turn = config.sfu.turn_server.is_some(),
        "SFU configured"
    );

    // 3. Start the hub and its janitor
    let hub = Hub::new(config.sfu.clone());
    let janitor = hub.spawn_janitor(Duration::from_secs(config.server.janitor_interval_seconds));

    // 4. Serve until shutdown
    server::serve(&config.http_address(), hub).await?;

    if let Err(e) = janitor.await {
        tracing::warn!("Room janitor task failed: {e}");
    }
    info!("Huddle SFU stopped");
    Ok(())
}
