use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tidepool_relay::{serve, RelayConfig, RelayState};

#[derive(Parser, Debug)]
#[command(name = "tidepool-relay", about = "WebSocket relay for tidepool channels")]
struct Cli {
    /// Overrides TIDEPOOL_RELAY_PORT.
    #[arg(long, short = 'p')]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = RelayConfig::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    info!(
        port = config.port,
        echo = config.echo,
        max_message_bytes = config.max_message_bytes,
        "starting tidepool relay"
    );

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("tidepool relay listening on {addr}");
    serve(listener, RelayState::new(config))
        .await
        .context("relay server failed")
}
