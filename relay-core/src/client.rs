//! Async driver running a [`Reconciler`] against a live transport.
//!
//! Each viewer is one task. Incoming messages and timer expirations
//! (highlight removal, reconnect backoff, liveness ping) are applied in the
//! order that task observes them. Shutting a viewer down drops all of its
//! timers with it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::feed::AnnouncementRecord;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::reconcile::{ConnectionState, HighlightTag, Reconciler, ReconcilerConfig, Reconnect};

/// Opens transports to the relay.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>, ClientError>;
}

#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, message: ClientMessage) -> Result<(), ClientError>;

    /// `None` once the transport has closed.
    async fn recv(&mut self) -> Option<Result<ServerMessage, ClientError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerCommand {
    Reconnect,
    RequestStatus,
    Shutdown,
}

/// What a viewer currently displays.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    pub connection: ConnectionState,
    pub items: Vec<AnnouncementRecord>,
    pub highlights: HashMap<String, HighlightTag>,
    pub polling_active: bool,
    pub synced: bool,
    pub connection_attempt: u32,
    pub last_diagnostic: Option<String>,
}

impl ViewState {
    fn of(reconciler: &Reconciler) -> Self {
        Self {
            connection: reconciler.state().clone(),
            items: reconciler.items().to_vec(),
            highlights: reconciler
                .highlights()
                .iter()
                .map(|(id, h)| (id.clone(), h.tag))
                .collect(),
            polling_active: reconciler.polling_active(),
            synced: reconciler.is_synced(),
            connection_attempt: reconciler.connection_attempt(),
            last_diagnostic: reconciler.last_diagnostic().map(ToOwned::to_owned),
        }
    }
}

pub struct ViewerHandle {
    commands: mpsc::Sender<ViewerCommand>,
    state: watch::Receiver<ViewState>,
    join: JoinHandle<()>,
}

impl ViewerHandle {
    pub fn state(&self) -> watch::Receiver<ViewState> {
        self.state.clone()
    }

    pub fn current(&self) -> ViewState {
        self.state.borrow().clone()
    }

    pub async fn reconnect(&self) {
        let _ = self.commands.send(ViewerCommand::Reconnect).await;
    }

    pub async fn request_status(&self) {
        let _ = self.commands.send(ViewerCommand::RequestStatus).await;
    }

    pub async fn shutdown(self) -> Result<(), tokio::task::JoinError> {
        let _ = self.commands.send(ViewerCommand::Shutdown).await;
        self.join.await
    }
}

pub fn spawn_viewer(connector: Arc<dyn Connector>, config: ReconcilerConfig) -> ViewerHandle {
    let reconciler = Reconciler::new(config);
    let (state_tx, state_rx) = watch::channel(ViewState::of(&reconciler));
    let (command_tx, command_rx) = mpsc::channel(16);
    let driver = Driver {
        connector,
        reconciler,
        commands: command_rx,
        state: state_tx,
    };
    let join = tokio::spawn(driver.run());
    ViewerHandle {
        commands: command_tx,
        state: state_rx,
        join,
    }
}

enum Phase {
    Connect,
    Connected(Box<dyn Connection>),
    Backoff(Instant),
    Exhausted,
    Shutdown,
}

struct Driver {
    connector: Arc<dyn Connector>,
    reconciler: Reconciler,
    commands: mpsc::Receiver<ViewerCommand>,
    state: watch::Sender<ViewState>,
}

impl Driver {
    async fn run(mut self) {
        let mut phase = Phase::Connect;
        loop {
            phase = match phase {
                Phase::Connect => self.connect().await,
                Phase::Connected(conn) => self.stream(conn).await,
                Phase::Backoff(until) => self.wait(Some(until)).await,
                Phase::Exhausted => self.wait(None).await,
                Phase::Shutdown => break,
            };
        }
        self.reconciler.shutdown();
        self.publish();
        info!("viewer stopped");
    }

    fn publish(&self) {
        self.state.send_replace(ViewState::of(&self.reconciler));
    }

    fn expire_highlights(&mut self) {
        let expired = self.reconciler.expire_highlights(Instant::now().into_std());
        if !expired.is_empty() {
            debug!(count = expired.len(), "highlights expired");
            self.publish();
        }
    }

    fn transport_lost(&mut self, reason: &str) -> Phase {
        let next = match self.reconciler.on_transport_lost(reason) {
            Reconnect::After(delay) => Phase::Backoff(Instant::now() + delay),
            Reconnect::Now => Phase::Connect,
            Reconnect::GiveUp => Phase::Exhausted,
            Reconnect::Nothing => Phase::Shutdown,
        };
        self.publish();
        next
    }

    /// `None` means keep going in the current phase.
    fn command(&mut self, command: Option<ViewerCommand>) -> Option<Phase> {
        match command {
            None | Some(ViewerCommand::Shutdown) => Some(Phase::Shutdown),
            Some(ViewerCommand::Reconnect) => {
                self.reconciler.manual_reconnect();
                self.publish();
                Some(Phase::Connect)
            }
            Some(ViewerCommand::RequestStatus) => None,
        }
    }

    async fn connect(&mut self) -> Phase {
        self.reconciler.begin_connect();
        self.publish();
        let connector = self.connector.clone();
        let connecting = connector.connect();
        tokio::pin!(connecting);
        loop {
            let deadline = self.reconciler.next_highlight_deadline();
            tokio::select! {
                result = &mut connecting => {
                    return match result {
                        Ok(conn) => {
                            self.reconciler.on_connected();
                            self.publish();
                            Phase::Connected(conn)
                        }
                        Err(err) => self.transport_lost(&err.to_string()),
                    };
                }
                command = self.commands.recv() => {
                    if let Some(next) = self.command(command) {
                        return next;
                    }
                }
                _ = highlight_timer(deadline) => self.expire_highlights(),
            }
        }
    }

    async fn stream(&mut self, mut conn: Box<dyn Connection>) -> Phase {
        let ping_interval = self.reconciler.config().ping_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let deadline = self.reconciler.next_highlight_deadline();
            tokio::select! {
                incoming = conn.recv() => match incoming {
                    Some(Ok(message)) => {
                        self.reconciler.apply(message, Instant::now().into_std());
                        self.publish();
                    }
                    Some(Err(ClientError::Decode(err))) => {
                        warn!(error = %err, "ignoring malformed server message");
                    }
                    Some(Err(err)) => return self.transport_lost(&err.to_string()),
                    None => return self.transport_lost("connection closed"),
                },
                command = self.commands.recv() => {
                    if command == Some(ViewerCommand::RequestStatus) {
                        if let Err(err) = conn.send(ClientMessage::RequestStatus).await {
                            return self.transport_lost(&err.to_string());
                        }
                    } else if let Some(next) = self.command(command) {
                        return next;
                    }
                }
                // Advisory only: a missing pong is not treated as a disconnect.
                _ = heartbeat.tick() => {
                    if let Err(err) = conn.send(ClientMessage::Ping).await {
                        return self.transport_lost(&err.to_string());
                    }
                }
                _ = highlight_timer(deadline) => self.expire_highlights(),
            }
        }
    }

    async fn wait(&mut self, until: Option<Instant>) -> Phase {
        loop {
            let deadline = self.reconciler.next_highlight_deadline();
            tokio::select! {
                _ = backoff_timer(until) => return Phase::Connect,
                command = self.commands.recv() => {
                    if let Some(next) = self.command(command) {
                        return next;
                    }
                }
                _ = highlight_timer(deadline) => self.expire_highlights(),
            }
        }
    }
}

async fn highlight_timer(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

async fn backoff_timer(until: Option<Instant>) {
    match until {
        Some(until) => tokio::time::sleep_until(until).await,
        None => std::future::pending().await,
    }
}
