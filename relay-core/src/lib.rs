pub mod client;
pub mod config;
pub mod dedup;
pub mod error;
pub mod feed;
pub mod hub;
pub mod identity;
pub mod poller;
pub mod protocol;
pub mod reconcile;
pub mod storage;

pub use client::{spawn_viewer, Connection, Connector, ViewState, ViewerCommand, ViewerHandle};
pub use config::RelayConfig;
pub use dedup::{DedupEngine, SeenSet};
pub use error::{ClientError, ConfigError, FetchError, ParseError, PollError, StoreError};
pub use feed::{normalize_timestamp, parse_feed, AnnouncementRecord, FeedCandidate, ParsedFeed};
pub use hub::{BroadcastHub, HubConfig, SessionId, Subscription};
pub use identity::record_identity;
pub use poller::{
    ingest, poll_once, spawn_poller, Fetcher, HttpFetcher, PollConfig, PollContext, PollState, Poller,
    PollerHandle,
};
pub use protocol::{ClientMessage, ServerMessage};
pub use reconcile::{ConnectionState, HighlightTag, Reconciler, ReconcilerConfig, Reconnect};
pub use storage::{JsonStore, PersistentStore};
