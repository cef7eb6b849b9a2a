use std::path::PathBuf;

use relay_core::RelayConfig;
use relay_server::{serve, AppState, ServerError};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    init_tracing();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("FEED_RELAY_CONFIG").map(PathBuf::from));
    let config = RelayConfig::load(config_path.as_deref());

    let state = AppState::with_http_fetcher(&config).await?;
    info!(
        stored = state.engine().stored_len().await?,
        feed = %config.server.feed_url,
        "relay state loaded"
    );

    if config.server.autostart {
        state.poller.start(None).await;
    }

    let listener = TcpListener::bind(&config.server.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "listening");
    serve(listener, state, shutdown_signal()).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
