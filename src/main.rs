use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use edgeroute::config::{LogFormat, StaticConfig};
use edgeroute::server::Server;

#[derive(Parser, Debug)]
#[command(name = "edgeroute")]
#[command(about = "Dynamic reverse proxy and load balancer")]
#[command(version)]
struct Args {
    /// Path to the static configuration file
    #[arg(short, long, default_value = "edgeroute.yaml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = StaticConfig::load(&args.config)?;

    // Initialize tracing
    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level))
    };

    let registry = tracing_subscriber::registry().with(filter);
    match config.log.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Common => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    info!("Loaded configuration from {:?}", args.config);

    if args.validate {
        if let Some(file) = &config.providers.file {
            edgeroute::config::load_dynamic(&file.filename)?;
        }
        info!("Configuration is valid");
        return Ok(());
    }

    info!("Starting edgeroute");
    Server::new(config).run().await
}
