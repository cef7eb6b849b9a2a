#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_core::{
    AnnouncementRecord, BroadcastHub, ClientError, ClientMessage, Connection, Connector, FeedCandidate,
    FetchError, Fetcher, JsonStore, PersistentStore, ServerMessage, SessionId, StoreError, Subscription,
    ViewState,
};
use tokio::sync::{mpsc, watch};

/// `(title, pubDate, link)`
pub type Item<'a> = (&'a str, &'a str, &'a str);

pub fn rss_doc(items: &[Item<'_>]) -> String {
    let mut body = String::new();
    for (title, published, link) in items {
        body.push_str(&format!(
            "<item><title>{title}</title><link>{link}</link><description>{title} details</description><pubDate>{published}</pubDate></item>"
        ));
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><rss version="2.0"><channel><title>Announcements</title><link>http://example.com/</link><description>Feed</description>{body}</channel></rss>"#
    )
}

pub fn record(item: Item<'_>) -> AnnouncementRecord {
    let (title, published, link) = item;
    FeedCandidate {
        published: published.into(),
        title: title.into(),
        description: format!("{title} details"),
        link: link.into(),
    }
    .into_record()
}

/// Records stamped one minute apart; index 0 is the oldest.
pub fn records_at_minutes(prefix: &str, minutes: std::ops::Range<u32>) -> Vec<AnnouncementRecord> {
    minutes
        .map(|m| {
            let title = format!("{prefix}-{m}");
            let published = format!("18-Oct-2026 {:02}:{:02}:00", 8 + m / 60, m % 60);
            let link = format!("http://example.com/{prefix}/{m}");
            record((&title, &published, &link))
        })
        .collect()
}

/// Replays a script of responses; the last one repeats forever.
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<Result<String, String>>>,
    last: Mutex<Option<Result<String, String>>>,
    pub calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new(script: Vec<Result<String, String>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, _url: &str) -> Result<String, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        let response = match next {
            Some(response) => {
                *self.last.lock().unwrap() = Some(response.clone());
                response
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Err("empty script".into())),
        };
        response.map_err(FetchError::Other)
    }
}

/// In-memory store whose writes can be switched to fail.
pub struct FlakyStore {
    inner: JsonStore,
    pub fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new(max_records: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: JsonStore::in_memory(max_records),
            fail_writes: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl PersistentStore for FlakyStore {
    async fn contains(&self, identifier: &str) -> Result<bool, StoreError> {
        self.inner.contains(identifier).await
    }

    async fn insert_batch(&self, records: &[AnnouncementRecord]) -> Result<usize, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk full".into()));
        }
        self.inner.insert_batch(records).await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AnnouncementRecord>, StoreError> {
        self.inner.recent(limit).await
    }

    async fn len(&self) -> Result<usize, StoreError> {
        self.inner.len().await
    }
}

/// Connects viewers straight to a hub, no network involved.
pub struct HubConnector {
    hub: Arc<BroadcastHub>,
    pub refuse: AtomicBool,
    sessions: Mutex<Vec<SessionId>>,
}

impl HubConnector {
    pub fn new(hub: Arc<BroadcastHub>) -> Arc<Self> {
        Arc::new(Self {
            hub,
            refuse: AtomicBool::new(false),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn last_session(&self) -> Option<SessionId> {
        self.sessions.lock().unwrap().last().copied()
    }

    pub fn connects(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for HubConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, ClientError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ClientError::Connect("connection refused".into()));
        }
        let subscription = self
            .hub
            .subscribe()
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        self.sessions.lock().unwrap().push(subscription.id);
        Ok(Box::new(HubConnection {
            hub: self.hub.clone(),
            subscription,
        }))
    }
}

struct HubConnection {
    hub: Arc<BroadcastHub>,
    subscription: Subscription,
}

#[async_trait]
impl Connection for HubConnection {
    async fn send(&mut self, message: ClientMessage) -> Result<(), ClientError> {
        let reply = match message {
            ClientMessage::Ping => ServerMessage::pong(),
            ClientMessage::RequestStatus => self.hub.status_message(),
        };
        if self.hub.send_to(self.subscription.id, reply).await {
            Ok(())
        } else {
            Err(ClientError::Closed)
        }
    }

    async fn recv(&mut self) -> Option<Result<ServerMessage, ClientError>> {
        self.subscription.messages.recv().await.map(Ok)
    }
}

pub async fn next_message(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("session closed")
}

pub async fn wait_for_view(
    rx: &mut watch::Receiver<ViewState>,
    predicate: impl FnMut(&ViewState) -> bool,
) -> ViewState {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
        .await
        .expect("timed out waiting for viewer state")
        .expect("viewer stopped")
        .clone()
}

pub fn temp_dir(tag: &str) -> std::path::PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push(format!(
        "feed_relay_{tag}_{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    dir
}
