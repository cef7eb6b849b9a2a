//! WebSocket transport for the viewer driver and a plain-text rendering of
//! what it holds.

use std::fmt::Write as _;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use relay_core::{
    ClientError, ClientMessage, Connection, ConnectionState, Connector, HighlightTag, ServerMessage, ViewState,
    ViewerCommand,
};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, ClientError> {
        let (stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        debug!(url = %self.url, "websocket connected");
        Ok(Box::new(WsConnection { stream }))
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, message: ClientMessage) -> Result<(), ClientError> {
        let text = serde_json::to_string(&message)?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<ServerMessage, ClientError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).map_err(ClientError::from)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(err) => return Some(Err(ClientError::Transport(err.to_string()))),
            }
        }
    }
}

/// Maps a line typed by the user to a viewer command.
pub fn parse_command(line: &str) -> Option<ViewerCommand> {
    match line.trim().to_ascii_lowercase().as_str() {
        "r" | "reconnect" => Some(ViewerCommand::Reconnect),
        "s" | "status" => Some(ViewerCommand::RequestStatus),
        "q" | "quit" | "exit" => Some(ViewerCommand::Shutdown),
        _ => None,
    }
}

fn connection_label(state: &ConnectionState) -> String {
    match state {
        ConnectionState::Connecting => "connecting".into(),
        ConnectionState::Connected => "connected".into(),
        ConnectionState::Disconnected => "disconnected".into(),
        ConnectionState::Exhausted { last_error } => format!("gave up ({last_error}), type 'r' to retry"),
        ConnectionState::Shutdown => "stopped".into(),
    }
}

/// Renders the working set newest first. Highlighted rows carry their
/// alternating marker.
pub fn render(view: &ViewState) -> String {
    let mut out = String::new();
    let polling = if view.polling_active { "on" } else { "off" };
    let _ = write!(
        out,
        "[{}] polling {polling} | {} items",
        connection_label(&view.connection),
        view.items.len()
    );
    if view.connection_attempt > 0 {
        let _ = write!(out, " | attempt {}", view.connection_attempt);
    }
    out.push('\n');
    if let Some(diagnostic) = &view.last_diagnostic {
        let _ = writeln!(out, "! {diagnostic}");
    }
    for item in &view.items {
        let marker = match view.highlights.get(&item.identifier) {
            Some(HighlightTag::A) => "*",
            Some(HighlightTag::B) => "+",
            None => " ",
        };
        let when = item
            .observed_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| item.published.clone());
        let _ = writeln!(out, "{marker} {when}  {}", item.title);
        if !item.link.is_empty() {
            let _ = writeln!(out, "    {}", item.link);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use relay_core::FeedCandidate;

    use super::*;

    fn view_with(items: Vec<relay_core::AnnouncementRecord>) -> ViewState {
        ViewState {
            connection: ConnectionState::Connected,
            items,
            highlights: HashMap::new(),
            polling_active: true,
            synced: true,
            connection_attempt: 0,
            last_diagnostic: None,
        }
    }

    #[test]
    fn commands_are_case_insensitive() {
        assert_eq!(parse_command("R"), Some(ViewerCommand::Reconnect));
        assert_eq!(parse_command(" status \n"), Some(ViewerCommand::RequestStatus));
        assert_eq!(parse_command("quit"), Some(ViewerCommand::Shutdown));
        assert_eq!(parse_command("hello"), None);
    }

    #[test]
    fn render_marks_highlighted_rows() {
        let fresh = FeedCandidate {
            published: "18-Oct-2026 10:00:00".into(),
            title: "Board meeting".into(),
            description: "Outcome".into(),
            link: "http://example.com/a".into(),
        }
        .into_record();
        let old = FeedCandidate {
            published: "garbled".into(),
            title: "Old notice".into(),
            description: "Text".into(),
            link: String::new(),
        }
        .into_record();
        let mut view = view_with(vec![fresh.clone(), old]);
        view.highlights.insert(fresh.identifier.clone(), HighlightTag::B);
        view.last_diagnostic = Some("Polling error: timeout".into());

        let text = render(&view);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "[connected] polling on | 2 items");
        assert_eq!(lines[1], "! Polling error: timeout");
        assert_eq!(lines[2], "+ 2026-10-18 10:00:00  Board meeting");
        assert_eq!(lines[3], "    http://example.com/a");
        assert_eq!(lines[4], "  garbled  Old notice");
        assert_eq!(lines.len(), 5);
    }

    #[test]
    fn render_shows_exhausted_state_and_attempts() {
        let mut view = view_with(Vec::new());
        view.connection = ConnectionState::Exhausted {
            last_error: "connection refused".into(),
        };
        view.connection_attempt = 11;
        view.polling_active = false;
        let text = render(&view);
        assert!(text.starts_with("[gave up (connection refused), type 'r' to retry] polling off | 0 items | attempt 11"));
    }
}
