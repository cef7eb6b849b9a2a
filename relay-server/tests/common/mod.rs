#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use relay_core::{FetchError, Fetcher, RelayConfig, ServerMessage};
use relay_server::{serve, AppState};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Serves whatever document it currently holds.
pub struct StubFetcher {
    body: Mutex<String>,
}

impl StubFetcher {
    pub fn new(body: String) -> Arc<Self> {
        Arc::new(Self { body: Mutex::new(body) })
    }

    pub fn set(&self, body: String) {
        *self.body.lock().unwrap() = body;
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, _url: &str) -> Result<String, FetchError> {
        Ok(self.body.lock().unwrap().clone())
    }
}

pub fn rss_doc(items: &[(&str, &str)]) -> String {
    let body: String = items
        .iter()
        .map(|(title, published)| {
            format!(
                "<item><title>{title}</title><link>http://example.com/{title}</link><description>{title}</description><pubDate>{published}</pubDate></item>"
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>T</title><link>http://example.com/</link><description>D</description>{body}</channel></rss>"#
    )
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub fetcher: Arc<StubFetcher>,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl TestServer {
    pub async fn start(feed: String) -> Self {
        let mut config = RelayConfig::default();
        config.store.path = None;
        config.poll.interval_seconds = 1;
        config.server.feed_url = "http://feed.test/rss".into();

        let fetcher = StubFetcher::new(feed);
        let state = AppState::from_config(&config, fetcher.clone()).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let join = tokio::spawn({
            let state = state.clone();
            async move {
                serve(listener, state, async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
            }
        });
        Self {
            addr,
            state,
            fetcher,
            shutdown: Some(tx),
            join: Some(join),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Triggers graceful shutdown and waits for the server to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            tokio::time::timeout(Duration::from_secs(5), join)
                .await
                .expect("server did not shut down")
                .unwrap();
        }
    }
}

/// Next server message on a websocket, skipping control frames.
pub async fn next_server_message<S>(ws: &mut S) -> ServerMessage
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for server message")
            .expect("websocket closed")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}
