use clap::Parser;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rcall_relay::config::Config;
use rcall_relay::{RelayState, router};

/// Development relay: forwards signaling envelopes between the peers of a room.
#[derive(Parser, Debug)]
#[command(name = "rcall-relay", version)]
struct Cli {
    /// Listen port; overrides RCALL_RELAY_PORT
    #[arg(long)]
    port: Option<u16>,

    /// Peers per room; overrides RCALL_RELAY_ROOM_CAPACITY
    #[arg(long)]
    room_capacity: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to WARN level if RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(capacity) = cli.room_capacity.filter(|capacity| *capacity > 0) {
        config.room_capacity = capacity;
    }

    let state = RelayState::new(config.room_capacity);
    let app = router(state).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        "rcall relay listening on {} (room capacity {})",
        addr, config.room_capacity
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
