use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{redirect, Client, ClientBuilder};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dedup::DedupEngine;
use crate::error::{FetchError, PollError};
use crate::feed::{parse_feed, AnnouncementRecord, FeedCandidate};
use crate::hub::BroadcastHub;

const USER_AGENT: &str = concat!("feed-relay/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    pub request_timeout: Duration,
    /// Extra fetch attempts within one cycle after the first failure.
    pub max_retries: u8,
    pub retry_backoff_ms: u64,
    /// When set, a cycle whose first `n` records are all already known is
    /// treated as having nothing new. Assumes a newest-first feed: a new
    /// record listed after that run is missed until it moves up.
    pub early_exit_threshold: Option<usize>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            max_retries: 2,
            retry_backoff_ms: 500,
            early_exit_threshold: None,
        }
    }
}

/// Retrieves raw feed content.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    max_retries: u8,
    retry_backoff: Duration,
}

impl HttpFetcher {
    pub fn new(config: &PollConfig) -> Result<Self, FetchError> {
        let client = ClientBuilder::new()
            .redirect(redirect::Policy::limited(5))
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: &PollConfig) -> Self {
        Self {
            client,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<String, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Err(FetchError::Empty);
        }
        Ok(body)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let attempts = u32::from(self.max_retries) + 1;
        let mut last_err = FetchError::Other("no fetch attempted".into());
        for attempt in 1..=attempts {
            match self.fetch_once(url).await {
                Ok(body) => return Ok(body),
                Err(err) => {
                    warn!(url, attempt, error = %err, "feed fetch failed");
                    last_err = err;
                    if attempt < attempts {
                        tokio::time::sleep(self.retry_backoff * attempt).await;
                    }
                }
            }
        }
        Err(last_err)
    }
}

/// Parses fetched content and admits what is new. Returns the cycle's delta
/// in feed order.
pub async fn ingest(
    content: &str,
    engine: &DedupEngine,
    config: &PollConfig,
) -> Result<Vec<AnnouncementRecord>, PollError> {
    let parsed = parse_feed(content)?;
    let candidates = parsed.candidates.len();
    let records: Vec<AnnouncementRecord> = parsed
        .candidates
        .into_iter()
        .map(FeedCandidate::into_record)
        .collect();

    if let Some(threshold) = config.early_exit_threshold.filter(|n| *n > 0) {
        if records.len() >= threshold && head_is_known(engine, &records[..threshold]).await? {
            debug!(threshold, "head of feed already known, skipping remainder");
            return Ok(Vec::new());
        }
    }

    let delta = engine.admit_all(records).await?;
    info!(candidates, skipped = parsed.skipped, admitted = delta.len(), "poll cycle complete");
    Ok(delta)
}

async fn head_is_known(engine: &DedupEngine, head: &[AnnouncementRecord]) -> Result<bool, PollError> {
    for record in head {
        if !engine.is_known(&record.identifier).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// One full fetch, parse and admit cycle.
pub async fn poll_once(
    url: &str,
    fetcher: &dyn Fetcher,
    engine: &DedupEngine,
    config: &PollConfig,
) -> Result<Vec<AnnouncementRecord>, PollError> {
    let content = fetcher.fetch(url).await?;
    ingest(&content, engine, config).await
}

/// Everything a running poll loop needs.
#[derive(Clone)]
pub struct PollContext {
    pub engine: Arc<DedupEngine>,
    pub fetcher: Arc<dyn Fetcher>,
    pub hub: Arc<BroadcastHub>,
}

pub struct PollerHandle {
    cancel_tx: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

impl PollerHandle {
    /// Requests shutdown and waits for the loop. A fetch in flight is
    /// abandoned; an admit in flight completes first.
    pub async fn stop(self) -> Result<(), PollError> {
        let _ = self.cancel_tx.send(());
        self.join.await.map_err(PollError::from)
    }
}

pub fn spawn_poller(url: String, ctx: PollContext, config: PollConfig) -> PollerHandle {
    let (cancel_tx, mut cancel_rx) = broadcast::channel(1);
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel_rx.recv() => {
                    info!("poller shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    debug!(url = %url, "polling feed");
                    let fetched = tokio::select! {
                        _ = cancel_rx.recv() => {
                            info!("poller shutdown requested during fetch");
                            break;
                        }
                        fetched = ctx.fetcher.fetch(&url) => fetched,
                    };
                    let outcome = match fetched {
                        Ok(content) => ingest(&content, &ctx.engine, &config).await,
                        Err(err) => Err(PollError::from(err)),
                    };
                    match outcome {
                        Ok(delta) if !delta.is_empty() => {
                            let delivered = ctx.hub.publish_delta(delta).await;
                            debug!(delivered, "delta broadcast");
                        }
                        Ok(_) => debug!("no new items"),
                        Err(err) => {
                            warn!(url = %url, error = %err, "poll cycle failed");
                            ctx.hub.publish_diagnostic(format!("Polling error: {err}")).await;
                        }
                    }
                }
            }
        }
    });

    PollerHandle { cancel_tx, join }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
}

struct PollerSlot {
    url: String,
    running: Option<PollerHandle>,
}

/// Owns the Idle/Polling toggle. At most one loop runs at a time; every
/// transition is announced through the hub.
pub struct Poller {
    ctx: PollContext,
    config: PollConfig,
    slot: Mutex<PollerSlot>,
}

impl Poller {
    pub fn new(ctx: PollContext, config: PollConfig, default_url: impl Into<String>) -> Self {
        Self {
            ctx,
            config,
            slot: Mutex::new(PollerSlot {
                url: default_url.into(),
                running: None,
            }),
        }
    }

    /// Starts polling `url` (or the last used URL). Returns false when a
    /// loop is already running.
    pub async fn start(&self, url: Option<String>) -> bool {
        let mut slot = self.slot.lock().await;
        if slot.running.is_some() {
            return false;
        }
        if let Some(url) = url {
            slot.url = url;
        }
        info!(url = %slot.url, "starting poller");
        // Announce before the first cycle can publish anything.
        self.ctx.hub.publish_status(true).await;
        slot.running = Some(spawn_poller(slot.url.clone(), self.ctx.clone(), self.config));
        true
    }

    /// Returns false when nothing was running.
    pub async fn stop(&self) -> bool {
        let mut slot = self.slot.lock().await;
        let Some(handle) = slot.running.take() else {
            return false;
        };
        if let Err(err) = handle.stop().await {
            warn!(error = %err, "poller task ended abnormally");
        }
        info!("poller stopped");
        self.ctx.hub.publish_status(false).await;
        true
    }

    pub async fn state(&self) -> PollState {
        if self.slot.lock().await.running.is_some() {
            PollState::Polling
        } else {
            PollState::Idle
        }
    }

    pub async fn url(&self) -> String {
        self.slot.lock().await.url.clone()
    }
}
