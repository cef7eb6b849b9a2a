use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::dedup::DedupEngine;
use crate::error::StoreError;
use crate::feed::AnnouncementRecord;
use crate::protocol::ServerMessage;

pub type SessionId = u64;

#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Per-session outbound queue length. A session whose queue is full is
    /// dropped; its viewer reconnects and resynchronises from a snapshot.
    pub queue_capacity: usize,
    /// Upper bound on records carried by a snapshot.
    pub snapshot_limit: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            snapshot_limit: 500,
        }
    }
}

/// A live session as seen by its transport: drain `messages` and forward
/// them. The channel closes when the hub drops the session.
#[derive(Debug)]
pub struct Subscription {
    pub id: SessionId,
    pub messages: mpsc::Receiver<ServerMessage>,
}

/// Registry of live sessions. Each session owns a bounded queue; fan-out
/// only ever `try_send`s, so a stalled session never holds up the others.
pub struct BroadcastHub {
    sessions: RwLock<HashMap<SessionId, mpsc::Sender<ServerMessage>>>,
    next_id: AtomicU64,
    polling_active: AtomicBool,
    engine: Arc<DedupEngine>,
    config: HubConfig,
}

impl BroadcastHub {
    pub fn new(engine: Arc<DedupEngine>, config: HubConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            polling_active: AtomicBool::new(false),
            engine,
            config,
        }
    }

    /// Registers a session and queues its snapshot. The registry stays
    /// write-locked until the snapshot is queued, so every delta published
    /// afterwards lands behind it.
    pub async fn subscribe(&self) -> Result<Subscription, StoreError> {
        let mut sessions = self.sessions.write().await;
        let items = self.engine.snapshot(self.config.snapshot_limit).await?;
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let snapshot = ServerMessage::snapshot(items, self.polling_active());
        if tx.try_send(snapshot).is_err() {
            warn!(session = id, "could not queue snapshot");
        }
        sessions.insert(id, tx);
        info!(session = id, total = sessions.len(), "subscriber connected");
        Ok(Subscription { id, messages: rx })
    }

    /// Idempotent.
    pub async fn unsubscribe(&self, id: SessionId) {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(&id).is_some() {
            info!(session = id, total = sessions.len(), "subscriber disconnected");
        }
    }

    /// Fans a poll cycle's delta out as one message. Returns the number of
    /// sessions that accepted it.
    pub async fn publish_delta(&self, records: Vec<AnnouncementRecord>) -> usize {
        if records.is_empty() {
            return 0;
        }
        self.broadcast(ServerMessage::delta(records)).await
    }

    pub async fn publish_status(&self, active: bool) -> usize {
        self.polling_active.store(active, Ordering::SeqCst);
        self.broadcast(ServerMessage::status(active)).await
    }

    pub async fn publish_diagnostic(&self, message: impl Into<String>) -> usize {
        self.broadcast(ServerMessage::diagnostic(message)).await
    }

    /// Sends to a single session, dropping it if it cannot accept.
    pub async fn send_to(&self, id: SessionId, message: ServerMessage) -> bool {
        let accepted = {
            let sessions = self.sessions.read().await;
            match sessions.get(&id) {
                Some(tx) => tx.try_send(message).is_ok(),
                None => return false,
            }
        };
        if !accepted {
            self.drop_sessions(vec![id]).await;
        }
        accepted
    }

    /// Drops every session. Their transports see the queue close after
    /// draining what was already queued.
    pub async fn close_all(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let closed = sessions.len();
        sessions.clear();
        if closed > 0 {
            info!(closed, "all subscribers disconnected");
        }
        closed
    }

    pub fn status_message(&self) -> ServerMessage {
        ServerMessage::status(self.polling_active())
    }

    pub fn polling_active(&self) -> bool {
        self.polling_active.load(Ordering::SeqCst)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn engine(&self) -> &Arc<DedupEngine> {
        &self.engine
    }

    async fn broadcast(&self, message: ServerMessage) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, tx) in sessions.iter() {
                match tx.try_send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(session = id, "subscriber queue full, dropping session");
                        dead.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(session = id, "subscriber transport closed");
                        dead.push(*id);
                    }
                }
            }
        }
        if !dead.is_empty() {
            self.drop_sessions(dead).await;
        }
        delivered
    }

    async fn drop_sessions(&self, ids: Vec<SessionId>) {
        let mut sessions = self.sessions.write().await;
        for id in ids {
            sessions.remove(&id);
        }
        info!(total = sessions.len(), "removed dead subscribers");
    }
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("polling_active", &self.polling_active())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
