//! Per-viewer reconciliation of snapshots and deltas into a bounded working
//! set, plus the connection lifecycle that drives reconnects.
//!
//! Pure state: time is passed in by the caller and timers are reported as
//! deadlines or delays for the caller to schedule.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::feed::{rank_and_truncate, AnnouncementRecord};
use crate::protocol::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcilerConfig {
    pub working_set_cap: usize,
    pub highlight_duration: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub ping_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            working_set_cap: 50,
            highlight_duration: Duration::from_secs(300),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            ping_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    /// Gave up after the maximum number of attempts. Left only through a
    /// manual reconnect.
    Exhausted { last_error: String },
    Shutdown,
}

/// Alternating marker for recently arrived records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HighlightTag {
    A,
    B,
}

impl HighlightTag {
    fn flip(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Highlight {
    pub tag: HighlightTag,
    pub expires_at: Instant,
}

/// What the caller should do after a connection event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconnect {
    After(Duration),
    Now,
    GiveUp,
    Nothing,
}

/// Result of applying one server message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Identifiers that entered the working set, in arrival order.
    pub added: Vec<String>,
    pub evicted: usize,
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    config: ReconcilerConfig,
    state: ConnectionState,
    items: Vec<AnnouncementRecord>,
    seen_identifiers: HashSet<String>,
    highlights: HashMap<String, Highlight>,
    next_tag: HighlightTag,
    connection_attempt: u32,
    polling_active: bool,
    synced: bool,
    last_diagnostic: Option<String>,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Connecting,
            items: Vec::new(),
            seen_identifiers: HashSet::new(),
            highlights: HashMap::new(),
            next_tag: HighlightTag::A,
            connection_attempt: 0,
            polling_active: false,
            synced: false,
            last_diagnostic: None,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn items(&self) -> &[AnnouncementRecord] {
        &self.items
    }

    pub fn highlights(&self) -> &HashMap<String, Highlight> {
        &self.highlights
    }

    pub fn highlight(&self, identifier: &str) -> Option<HighlightTag> {
        self.highlights.get(identifier).map(|h| h.tag)
    }

    pub fn is_seen(&self, identifier: &str) -> bool {
        self.seen_identifiers.contains(identifier)
    }

    pub fn connection_attempt(&self) -> u32 {
        self.connection_attempt
    }

    pub fn polling_active(&self) -> bool {
        self.polling_active
    }

    pub fn last_diagnostic(&self) -> Option<&str> {
        self.last_diagnostic.as_deref()
    }

    /// True once the first snapshot of the current connection has arrived.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn apply(&mut self, message: ServerMessage, now: Instant) -> MergeOutcome {
        match message {
            ServerMessage::Snapshot {
                items,
                polling_active,
                ..
            } => {
                self.polling_active = polling_active;
                self.apply_snapshot(items)
            }
            ServerMessage::Delta { items, .. } => self.apply_delta(items, now),
            ServerMessage::Status { polling_active, .. } => {
                self.polling_active = polling_active;
                MergeOutcome::default()
            }
            ServerMessage::Error { message } => {
                warn!(%message, "server diagnostic");
                self.last_diagnostic = Some(message);
                MergeOutcome::default()
            }
            ServerMessage::Pong { .. } => MergeOutcome::default(),
        }
    }

    /// Replaces the baseline. Nothing in a snapshot is highlighted; existing
    /// highlights survive only for records still in the working set.
    fn apply_snapshot(&mut self, items: Vec<AnnouncementRecord>) -> MergeOutcome {
        self.seen_identifiers = items.iter().map(|r| r.identifier.clone()).collect();
        let mut items = items;
        rank_and_truncate(&mut items, self.config.working_set_cap);
        self.items = items;
        self.retain_visible_highlights();
        self.synced = true;
        debug!(items = self.items.len(), "applied snapshot");
        MergeOutcome::default()
    }

    fn apply_delta(&mut self, items: Vec<AnnouncementRecord>, now: Instant) -> MergeOutcome {
        if !self.synced {
            debug!("ignoring delta received before snapshot");
            return MergeOutcome::default();
        }
        let fresh: Vec<AnnouncementRecord> = items
            .into_iter()
            .filter(|r| self.seen_identifiers.insert(r.identifier.clone()))
            .collect();
        if fresh.is_empty() {
            return MergeOutcome::default();
        }

        let arrival: Vec<String> = fresh.iter().map(|r| r.identifier.clone()).collect();
        let before = self.items.len() + fresh.len();
        self.items.extend(fresh);
        rank_and_truncate(&mut self.items, self.config.working_set_cap);
        let evicted = before - self.items.len();

        let retained: HashSet<&str> = self.items.iter().map(|r| r.identifier.as_str()).collect();
        let mut added = Vec::new();
        for identifier in arrival {
            if !retained.contains(identifier.as_str()) {
                continue;
            }
            let highlight = Highlight {
                tag: self.next_tag,
                expires_at: now + self.config.highlight_duration,
            };
            self.next_tag = self.next_tag.flip();
            self.highlights.insert(identifier.clone(), highlight);
            added.push(identifier);
        }
        drop(retained);
        self.retain_visible_highlights();
        debug!(added = added.len(), evicted, "applied delta");
        MergeOutcome { added, evicted }
    }

    fn retain_visible_highlights(&mut self) {
        let visible: HashSet<&str> = self.items.iter().map(|r| r.identifier.as_str()).collect();
        self.highlights.retain(|id, _| visible.contains(id.as_str()));
    }

    /// Drops expired highlights and returns their identifiers.
    pub fn expire_highlights(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .highlights
            .iter()
            .filter(|(_, h)| h.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.highlights.remove(id);
        }
        expired
    }

    pub fn next_highlight_deadline(&self) -> Option<Instant> {
        self.highlights.values().map(|h| h.expires_at).min()
    }

    pub fn begin_connect(&mut self) {
        if self.state != ConnectionState::Shutdown {
            self.state = ConnectionState::Connecting;
        }
    }

    /// The transport is up. A fresh snapshot is expected before any delta
    /// is merged.
    pub fn on_connected(&mut self) {
        if self.state == ConnectionState::Shutdown {
            return;
        }
        info!(after_attempts = self.connection_attempt, "connected");
        self.state = ConnectionState::Connected;
        self.connection_attempt = 0;
        self.synced = false;
    }

    /// Covers both a dropped connection and a failed connect.
    pub fn on_transport_lost(&mut self, reason: &str) -> Reconnect {
        match self.state {
            ConnectionState::Shutdown | ConnectionState::Exhausted { .. } => return Reconnect::Nothing,
            _ => {}
        }
        self.synced = false;
        self.connection_attempt += 1;
        if self.connection_attempt > self.config.max_reconnect_attempts {
            warn!(attempts = self.connection_attempt - 1, %reason, "giving up on reconnecting");
            self.state = ConnectionState::Exhausted {
                last_error: reason.to_owned(),
            };
            return Reconnect::GiveUp;
        }
        self.state = ConnectionState::Disconnected;
        let delay = self.backoff_delay();
        info!(attempt = self.connection_attempt, ?delay, %reason, "connection lost, scheduling reconnect");
        Reconnect::After(delay)
    }

    /// Exponential in the attempt number, capped.
    pub fn backoff_delay(&self) -> Duration {
        let exponent = self.connection_attempt.saturating_sub(1).min(31);
        self.config
            .reconnect_base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.config.reconnect_max_delay)
    }

    /// Resets the attempt counter and bypasses backoff.
    pub fn manual_reconnect(&mut self) -> Reconnect {
        if self.state == ConnectionState::Shutdown {
            return Reconnect::Nothing;
        }
        self.connection_attempt = 0;
        self.state = ConnectionState::Connecting;
        Reconnect::Now
    }

    pub fn shutdown(&mut self) {
        self.state = ConnectionState::Shutdown;
        self.synced = false;
        self.highlights.clear();
    }
}
