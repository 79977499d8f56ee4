//! Controller - the driver side of a remote run
//!
//! Accepts endpoint connections, requests runs and consumes their event
//! streams. Several endpoints may connect under the same identity; each
//! physical connection gets its own [`ConnectionId`].

mod server;
pub mod session;

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::codec::DecodedEvent;
use crate::common::{Error, Result};
use crate::protocol::{CloseInfo, ControlMessage, EventName};

use server::{SharedRegistry, GOING_AWAY};

pub use session::{FailureReport, RunPhase, RunSummary, RunTracker};

/// Physical connection handle, unique per controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Something that happened on one of the controller's connections
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// Handshake completed
    Connected { id: ConnectionId, identity: String },
    /// Lifecycle event decoded from an endpoint frame
    Event { id: ConnectionId, event: DecodedEvent },
    /// Connection closed, by either side
    Disconnected {
        id: ConnectionId,
        identity: String,
        close: CloseInfo,
    },
}

impl ControllerEvent {
    pub fn id(&self) -> ConnectionId {
        match self {
            Self::Connected { id, .. } | Self::Event { id, .. } | Self::Disconnected { id, .. } => {
                *id
            }
        }
    }
}

/// Snapshot of an open connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub identity: String,
    pub peer: SocketAddr,
    pub phase: RunPhase,
}

/// How a waiter treats an event it pulled off the queue
enum Claim<T> {
    /// Not for this waiter; keep it for later readers
    Skip,
    /// Consumed, keep waiting
    Take,
    /// Consumed, waiting is over
    Done(Result<T>),
}

/// WebSocket server endpoints connect to
pub struct Controller {
    local_addr: SocketAddr,
    registry: SharedRegistry,
    events: mpsc::UnboundedReceiver<ControllerEvent>,
    /// Events skipped by a waiter, delivered before newer ones
    backlog: VecDeque<ControllerEvent>,
    accept: JoinHandle<()>,
}

impl Controller {
    /// Bind and start accepting endpoints
    ///
    /// Bind to port 0 to let the OS pick one; see [`Controller::local_addr`].
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::bind(addr, e))?;
        let local_addr = listener.local_addr()?;

        let registry: SharedRegistry = Arc::new(Mutex::new(Default::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        let accept = tokio::spawn(server::accept_loop(listener, registry.clone(), tx));

        tracing::info!(addr = %local_addr, "Controller listening");
        Ok(Self {
            local_addr,
            registry,
            events: rx,
            backlog: VecDeque::new(),
            accept,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL endpoints should connect to
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Next event from any connection
    pub async fn next_event(&mut self) -> Option<ControllerEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        self.events.recv().await
    }

    /// Open connections, oldest first
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let registry = server::lock(&self.registry);
        let mut connections: Vec<ConnectionInfo> = registry
            .connections
            .iter()
            .map(|(id, entry)| ConnectionInfo {
                id: *id,
                identity: entry.identity.clone(),
                peer: entry.peer,
                phase: entry.tracker.phase(),
            })
            .collect();
        connections.sort_by_key(|info| info.id);
        connections
    }

    /// Most recent open connection with the given identity
    pub fn find(&self, identity: &str) -> Option<ConnectionId> {
        server::lock(&self.registry)
            .connections
            .iter()
            .filter(|(_, entry)| entry.identity == identity)
            .map(|(id, _)| *id)
            .max()
    }

    pub fn run_phase(&self, id: ConnectionId) -> Option<RunPhase> {
        server::lock(&self.registry)
            .connections
            .get(&id)
            .map(|entry| entry.tracker.phase())
    }

    /// Send a run request to one connection
    ///
    /// Refused while a previous request on the same connection has not
    /// reached `end`.
    pub fn request_run(&self, id: ConnectionId) -> Result<()> {
        let text = serde_json::to_string(&ControlMessage::Run)?;
        let mut registry = server::lock(&self.registry);
        let entry = registry
            .connections
            .get_mut(&id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        if !entry.tracker.request() {
            return Err(Error::RunInProgress(entry.tracker.requested()));
        }
        entry
            .outbound
            .send(Message::Text(text))
            .map_err(|_| Error::NotConnected)?;
        tracing::info!(%id, identity = %entry.identity, "Requested run");
        Ok(())
    }

    /// Send a run request to the most recent connection with `identity`
    pub fn request_run_for(&self, identity: &str) -> Result<ConnectionId> {
        let id = self
            .find(identity)
            .ok_or_else(|| Error::SessionNotFound(identity.to_string()))?;
        self.request_run(id)?;
        Ok(id)
    }

    /// Forget the run in flight on a connection so a new one can be requested
    ///
    /// For runs that will never reach `end`, e.g. when the endpoint rejected
    /// the request or aborted the run.
    pub fn reset_run(&self, id: ConnectionId) -> Result<RunPhase> {
        let mut registry = server::lock(&self.registry);
        let entry = registry
            .connections
            .get_mut(&id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        let abandoned = entry.tracker.abandon();
        if abandoned != RunPhase::Idle {
            tracing::warn!(%id, phase = %abandoned, "Abandoned run");
        }
        Ok(abandoned)
    }

    /// Close one connection with the given code
    ///
    /// Any code but 1000 makes an endpoint with `auto_retry` reconnect.
    pub fn close(&self, id: ConnectionId, code: u16, reason: &str) -> Result<()> {
        let registry = server::lock(&self.registry);
        let entry = registry
            .connections
            .get(&id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        tracing::debug!(%id, code, reason, "Closing connection");
        entry
            .outbound
            .send(server::close_message(code, reason))
            .map_err(|_| Error::NotConnected)
    }

    async fn wait_for<T, F>(&mut self, timeout: Duration, mut claim: F) -> Result<T>
    where
        F: FnMut(&ControllerEvent) -> Claim<T>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut skipped = VecDeque::new();

        let result = loop {
            let event = match self.backlog.pop_front() {
                Some(event) => event,
                None => match tokio::time::timeout_at(deadline, self.events.recv()).await {
                    Ok(Some(event)) => event,
                    Ok(None) => break Err(Error::ControllerClosed),
                    Err(_) => break Err(Error::Timeout(timeout)),
                },
            };
            match claim(&event) {
                Claim::Skip => skipped.push_back(event),
                Claim::Take => {}
                Claim::Done(result) => break result,
            }
        };

        skipped.append(&mut self.backlog);
        self.backlog = skipped;
        result
    }

    /// Wait until an endpoint with `identity` is connected
    pub async fn wait_for_connection(
        &mut self,
        identity: &str,
        timeout: Duration,
    ) -> Result<ConnectionId> {
        if let Some(id) = self.find(identity) {
            return Ok(id);
        }
        tracing::debug!(%identity, "Waiting for endpoint");
        let registry = self.registry.clone();
        self.wait_for(timeout, |event| match event {
            // A backlogged connect may belong to a connection that is gone
            ControllerEvent::Connected { id, identity: seen }
                if seen == identity && server::lock(&registry).connections.contains_key(id) =>
            {
                Claim::Done(Ok(*id))
            }
            _ => Claim::Skip,
        })
        .await
    }

    /// Wait until the connection closes
    pub async fn wait_for_disconnect(
        &mut self,
        id: ConnectionId,
        timeout: Duration,
    ) -> Result<CloseInfo> {
        self.wait_for(timeout, |event| match event {
            ControllerEvent::Disconnected { id: from, close, .. } if *from == id => {
                Claim::Done(Ok(close.clone()))
            }
            _ => Claim::Skip,
        })
        .await
    }

    /// Consume one run's events from a connection until `end`
    ///
    /// `on_event` sees every event of the run in arrival order. Fails with
    /// [`Error::ConnectionLost`] if the connection closes first. On timeout
    /// the run is abandoned, so the connection accepts a new request.
    pub async fn run_to_completion<F>(
        &mut self,
        id: ConnectionId,
        timeout: Duration,
        mut on_event: F,
    ) -> Result<RunSummary>
    where
        F: FnMut(&DecodedEvent),
    {
        let mut summary = RunSummary::new();
        let result = self.wait_for(timeout, |item| match item {
            ControllerEvent::Event { id: from, event } if *from == id => {
                summary.record(event);
                on_event(event);
                if event.name == EventName::End {
                    Claim::Done(Ok(()))
                } else {
                    Claim::Take
                }
            }
            ControllerEvent::Disconnected { id: from, close, .. } if *from == id => {
                Claim::Done(Err(Error::ConnectionLost(close.clone())))
            }
            _ => Claim::Skip,
        })
        .await;
        if let Err(Error::Timeout(_)) = result {
            let _ = self.reset_run(id);
        }
        result?;

        tracing::info!(
            %id,
            tests = summary.tests,
            passes = summary.passes,
            failures = summary.failures,
            pending = summary.pending,
            "Run completed"
        );
        Ok(summary)
    }

    /// Stop accepting and close every connection with 1001
    pub fn shutdown(self) {
        let mut registry = server::lock(&self.registry);
        for (id, entry) in registry.connections.drain() {
            tracing::debug!(%id, "Closing connection on shutdown");
            let _ = entry
                .outbound
                .send(server::close_message(GOING_AWAY, "controller shutting down"));
        }
        tracing::info!(addr = %self.local_addr, "Controller shut down");
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.accept.abort();
    }
}
