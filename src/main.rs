use clap::Parser;
use rustsocks_core::config::Config;
use rustsocks_core::server::SocksServer;
use rustsocks_core::Result;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "rustsocks")]
#[command(about = "SOCKS5 proxy server (RFC 1928, RFC 1929)", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Bind host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Maximum concurrent connections (overrides config)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Write an example configuration file to the given path and exit
    #[arg(long, value_name = "FILE")]
    generate_config: Option<PathBuf>,

    /// Log level (disabled, debug, info, warning, error, critical)
    #[arg(long, default_value = "info")]
    logging_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(config_path) = args.generate_config {
        Config::create_example(&config_path)?;
        println!("Example configuration written to {}", config_path.display());
        return Ok(());
    }

    init_logging(&args.logging_level)?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting rustsocks");

    let mut config = if let Some(config_path) = args.config {
        info!(path = %config_path.display(), "loading configuration file");
        Config::from_file(config_path)?
    } else {
        info!("no configuration file specified, using defaults");
        Config::default()
    };

    if let Some(host) = args.host {
        config.server.bind_address = host;
    }
    if let Some(port) = args.port {
        config.server.bind_port = port;
    }
    if let Some(max_connections) = args.max_connections {
        config.server.max_connections = max_connections;
    }

    let server = SocksServer::new(config);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down");
            signal_token.cancel();
        }
    });

    if let Err(e) = server.run(shutdown).await {
        error!(error = %e, "server exited with error");
        return Err(e);
    }

    Ok(())
}

/// Translates the external `--logging-level` vocabulary into a directive
/// `EnvFilter` understands. The two don't line up one-to-one: `disabled`,
/// `warning` and `critical` all need renaming, the rest pass through as-is.
fn translate_logging_level(level: &str) -> String {
    match level.to_ascii_lowercase().as_str() {
        "disabled" => "off".to_string(),
        "warning" => "warn".to_string(),
        "critical" => "error".to_string(),
        other => other.to_string(),
    }
}

fn init_logging(level: &str) -> Result<()> {
    let directive = translate_logging_level(level);
    let env_filter = EnvFilter::try_new(&directive)
        .map_err(|e| rustsocks_core::ProxyError::Config(format!("invalid log level: {e}")))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    Ok(())
}
