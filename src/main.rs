use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reproxy::config::Config;
use reproxy::errors::AppError;

#[derive(Parser)]
#[command(name = "reproxy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A dynamic reverse proxy with live service discovery and pluggable middleware")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "reproxy.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Plain-HTTP listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("reproxy={0},access={0}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting reproxy v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match Config::load_from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration is unusable: {e}");
            std::process::exit(2);
        }
    };

    // CLI overrides
    if let Some(host) = cli.host {
        config.listen.host = host;
    }
    if let Some(port) = cli.port {
        config.listen.http_port = Some(port);
    }

    match reproxy::app::run(config).await {
        Ok(()) => Ok(()),
        Err(AppError::Configuration { message }) => {
            error!("configuration is unusable: {message}");
            std::process::exit(2);
        }
        Err(e) => Err(e.into()),
    }
}
