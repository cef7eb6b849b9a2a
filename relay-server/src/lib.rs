//! HTTP and WebSocket surface of the relay.
//!
//! ```text
//! GET  /               service banner
//! GET  /health         liveness plus polling and session counts
//! GET  /status         polling state and feed URL
//! GET  /items          every stored record, newest first
//! POST /start-polling  optional {"url": "..."}
//! POST /stop-polling
//! GET  /ws             snapshot, then delta/status/error stream
//! ```

use std::future::Future;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use relay_core::{
    BroadcastHub, ClientMessage, DedupEngine, Fetcher, HttpFetcher, JsonStore, PersistentStore, PollContext,
    PollState, Poller, RelayConfig, ServerMessage, SessionId, StoreError,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("fetcher error: {0}")]
    Fetch(#[from] relay_core::FetchError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub poller: Arc<Poller>,
}

impl AppState {
    /// Wires store, engine, hub and poller from configuration.
    pub async fn from_config(config: &RelayConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self, ServerError> {
        let store: Arc<dyn PersistentStore> = match &config.store.path {
            Some(path) => Arc::new(JsonStore::load_from(path, config.store.max_records).await),
            None => Arc::new(JsonStore::in_memory(config.store.max_records)),
        };
        let engine = Arc::new(DedupEngine::load(store, config.store.seen_capacity).await?);
        let hub = Arc::new(BroadcastHub::new(engine.clone(), config.hub_config()));
        let ctx = PollContext {
            engine,
            fetcher,
            hub: hub.clone(),
        };
        let poller = Arc::new(Poller::new(ctx, config.poll_config(), config.server.feed_url.clone()));
        Ok(Self { hub, poller })
    }

    /// Same as [`AppState::from_config`] with the real HTTP fetcher.
    pub async fn with_http_fetcher(config: &RelayConfig) -> Result<Self, ServerError> {
        let fetcher = Arc::new(HttpFetcher::new(&config.poll_config())?);
        Self::from_config(config, fetcher).await
    }

    pub fn engine(&self) -> &Arc<DedupEngine> {
        self.hub.engine()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/items", get(items))
        .route("/start-polling", post(start_polling))
        .route("/stop-polling", post(stop_polling))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

/// Serves until `shutdown` resolves, then stops the poll loop and closes
/// every live session so the listener can drain.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let on_shutdown = state.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("shutdown requested");
            on_shutdown.poller.stop().await;
            on_shutdown.hub.close_all().await;
        })
        .await?;
    Ok(())
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "status": "error", "message": self.message }));
        (self.status, body).into_response()
    }
}

async fn root() -> Json<Value> {
    Json(json!({
        "name": "feed-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "websocketEndpoint": "/ws",
    }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "pollingActive": state.poller.state().await == PollState::Polling,
        "connectedClients": state.hub.session_count().await,
    }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "pollingActive": state.poller.state().await == PollState::Polling,
        "connectedClients": state.hub.session_count().await,
        "url": state.poller.url().await,
    }))
}

async fn items(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let engine = state.engine();
    let stored = engine.stored_len().await?;
    let items = engine.snapshot(stored).await?;
    Ok(Json(json!({ "count": items.len(), "items": items })))
}

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    url: Option<String>,
}

fn validate_feed_url(raw: &str) -> Result<String, ApiError> {
    let parsed = url::Url::parse(raw.trim()).map_err(|e| ApiError::bad_request(format!("invalid URL: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed.to_string()),
        other => Err(ApiError::bad_request(format!("unsupported URL scheme: {other}"))),
    }
}

async fn start_polling(
    State(state): State<AppState>,
    body: Option<Json<StartRequest>>,
) -> Result<Json<Value>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let url = request.url.as_deref().map(validate_feed_url).transpose()?;
    if !state.poller.start(url).await {
        return Ok(Json(json!({ "status": "warning", "message": "Polling already active" })));
    }
    Ok(Json(json!({
        "status": "success",
        "message": "Polling started",
        "url": state.poller.url().await,
    })))
}

async fn stop_polling(State(state): State<AppState>) -> Json<Value> {
    if state.poller.stop().await {
        Json(json!({ "status": "success", "message": "Polling stopped" }))
    } else {
        Json(json!({ "status": "warning", "message": "Polling not active" }))
    }
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| ws_session(socket, state.hub))
}

async fn ws_session(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let subscription = match hub.subscribe().await {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!(error = %err, "could not build snapshot, refusing session");
            return;
        }
    };
    let id = subscription.id;
    let mut messages = subscription.messages;
    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(session = id, error = %err, "failed to encode message");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader_hub = hub.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => handle_client_text(&reader_hub, id, text.as_str()).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!(session = id, error = %err, "websocket read failed");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }
    hub.unsubscribe(id).await;
}

/// Replies go through the session's own queue so they stay ordered with
/// broadcasts.
async fn handle_client_text(hub: &BroadcastHub, id: SessionId, text: &str) {
    let reply = match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Ping) => ServerMessage::pong(),
        Ok(ClientMessage::RequestStatus) => hub.status_message(),
        Err(_) => {
            debug!(session = id, "unrecognized client message");
            ServerMessage::diagnostic("unrecognized message")
        }
    };
    hub.send_to(id, reply).await;
}
