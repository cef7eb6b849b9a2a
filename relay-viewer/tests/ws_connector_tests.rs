use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relay_core::{
    spawn_viewer, ClientMessage, ConnectionState, Connector, FeedCandidate, HighlightTag, ReconcilerConfig,
    ServerMessage, ViewState,
};
use relay_viewer::WsConnector;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

fn record(title: &str, published: &str) -> relay_core::AnnouncementRecord {
    FeedCandidate {
        published: published.into(),
        title: title.into(),
        description: format!("{title} details"),
        link: format!("http://example.com/{title}"),
    }
    .into_record()
}

/// One-shot relay: accepts a single websocket, sends `script`, then reports
/// every text frame the viewer sends until the socket closes.
async fn scripted_relay(script: Vec<String>) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        for text in script {
            ws.send(Message::Text(text)).await.unwrap();
        }
        while let Some(Ok(frame)) = ws.next().await {
            if let Message::Text(text) = frame {
                let reply = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Ping) => Some(ServerMessage::pong()),
                    Ok(ClientMessage::RequestStatus) => Some(ServerMessage::status(true)),
                    Err(_) => None,
                };
                let _ = seen_tx.send(text);
                if let Some(reply) = reply {
                    let _ = ws.send(Message::Text(serde_json::to_string(&reply).unwrap())).await;
                }
            }
        }
    });
    (url, seen_rx)
}

async fn wait_for_view(rx: &mut watch::Receiver<ViewState>, predicate: impl FnMut(&ViewState) -> bool) -> ViewState {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
        .await
        .expect("timed out waiting for viewer state")
        .expect("viewer stopped")
        .clone()
}

#[tokio::test]
async fn viewer_reconciles_a_live_websocket_stream() {
    let baseline = record("Baseline", "18-Oct-2026 09:00:00");
    let fresh = record("Fresh", "18-Oct-2026 10:00:00");
    let script = vec![
        serde_json::to_string(&ServerMessage::snapshot(vec![baseline.clone()], false)).unwrap(),
        "{\"kind\":\"mystery\"}".to_string(),
        serde_json::to_string(&ServerMessage::delta(vec![fresh.clone()])).unwrap(),
    ];
    let (url, mut seen) = scripted_relay(script).await;

    let config = ReconcilerConfig {
        ping_interval: Duration::from_millis(50),
        ..ReconcilerConfig::default()
    };
    let viewer = spawn_viewer(Arc::new(WsConnector::new(url)), config);
    let mut state = viewer.state();

    let view = wait_for_view(&mut state, |v| v.items.len() == 2).await;
    assert_eq!(view.connection, ConnectionState::Connected);
    assert_eq!(view.items[0], fresh);
    assert_eq!(view.highlights.get(&fresh.identifier), Some(&HighlightTag::A));
    assert!(!view.highlights.contains_key(&baseline.identifier));

    let ping = tokio::time::timeout(Duration::from_secs(5), seen.recv()).await.unwrap().unwrap();
    assert_eq!(ping, r#"{"kind":"ping"}"#);

    viewer.request_status().await;
    wait_for_view(&mut state, |v| v.polling_active).await;

    viewer.shutdown().await.unwrap();
}

#[tokio::test]
async fn connect_to_a_closed_port_is_a_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    drop(listener);

    let connector = WsConnector::new(url);
    match connector.connect().await {
        Err(relay_core::ClientError::Connect(_)) => {}
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("connected to a closed port"),
    }
}
