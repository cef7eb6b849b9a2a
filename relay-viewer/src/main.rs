use std::path::PathBuf;
use std::sync::Arc;

use relay_core::{spawn_viewer, RelayConfig, ViewerCommand};
use relay_viewer::{parse_command, render, WsConnector};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    init_tracing();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("FEED_RELAY_CONFIG").map(PathBuf::from));
    let config = RelayConfig::load(config_path.as_deref());
    let connector = Arc::new(WsConnector::new(config.client.server_url.clone()));
    info!(url = %connector.url(), "starting viewer");

    let viewer = spawn_viewer(connector, config.reconciler_config());
    let mut state = viewer.state();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    println!("commands: r = reconnect, s = request status, q = quit");

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = state.borrow_and_update().clone();
                println!("{}", render(&view));
            }
            line = stdin.next_line() => match line {
                Ok(Some(line)) => match parse_command(&line) {
                    Some(ViewerCommand::Shutdown) => break,
                    Some(ViewerCommand::Reconnect) => viewer.reconnect().await,
                    Some(ViewerCommand::RequestStatus) => viewer.request_status().await,
                    None => println!("unknown command: {}", line.trim()),
                },
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "failed to read stdin");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Err(err) = viewer.shutdown().await {
        warn!(error = %err, "viewer task ended abnormally");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
