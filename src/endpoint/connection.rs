//! Connection manager
//!
//! Owns the endpoint's single WebSocket connection. Every `connect()` starts
//! one attempt, identified by a monotonically increasing number; the task
//! driving an attempt only touches shared state while its attempt is still
//! the active one, so a `disconnect()` silently detaches it.
//!
//! After an abnormal close (any code but 1000, including a failed connect)
//! one reconnect attempt is scheduled `retry_delay` later when `auto_retry`
//! is enabled. `disconnect()` suppresses reconnects until the next explicit
//! `connect()`; the flag is checked under the same lock that starts an
//! attempt, so no reconnect can begin after `disconnect()` returns.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::common::{Error, Result};
use crate::protocol::{CloseInfo, ControlMessage, NORMAL_CLOSURE, NO_STATUS, SUBPROTOCOL_HEADER};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

pub(crate) type MessageHandler = Box<dyn Fn(ControlMessage) + Send + Sync>;
pub(crate) type ConnectedCallback = Arc<dyn Fn() + Send + Sync>;
pub(crate) type DisconnectedCallback = Arc<dyn Fn(&CloseInfo) + Send + Sync>;

/// Settings fixed for the manager's lifetime
pub(crate) struct ConnectionSettings {
    pub url: String,
    pub identity: String,
    pub auto_retry: bool,
    pub retry_delay: Duration,
    pub on_connected: Option<ConnectedCallback>,
    pub on_disconnected: Option<DisconnectedCallback>,
}

struct State {
    status: ConnectionStatus,
    /// Last attempt number handed out
    attempt: u64,
    /// Attempt owning the current connection; `None` when detached
    active: Option<u64>,
    /// Outbound queue of the open connection
    outbound: Option<mpsc::UnboundedSender<Message>>,
    /// Pending reconnect timer
    retry: Option<JoinHandle<()>>,
    /// Set by `disconnect()`, cleared by `connect()`
    suppressed: bool,
}

struct Shared {
    settings: ConnectionSettings,
    handler: MessageHandler,
    state: Mutex<State>,
}

/// Handle to the endpoint's connection, cheap to clone
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub(crate) fn new(settings: ConnectionSettings, handler: MessageHandler) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                handler,
                state: Mutex::new(State {
                    status: ConnectionStatus::Closed,
                    attempt: 0,
                    active: None,
                    outbound: None,
                    retry: None,
                    suppressed: false,
                }),
            }),
        }
    }

    /// Check that the URL and identity form a valid handshake request
    pub(crate) fn validate(&self) -> Result<()> {
        self.request().map(|_| ())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn request(&self) -> Result<Request> {
        let settings = &self.shared.settings;
        let mut request = settings.url.as_str().into_client_request()?;
        let protocol = HeaderValue::from_str(&settings.identity)
            .map_err(|_| Error::InvalidIdentity(settings.identity.clone()))?;
        request.headers_mut().insert(SUBPROTOCOL_HEADER, protocol);
        Ok(request)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock().status
    }

    /// Number of connection attempts made so far
    pub fn attempts(&self) -> u64 {
        self.lock().attempt
    }

    /// Start a connection attempt
    ///
    /// Returns immediately; `once` runs after the configured `on_connected`
    /// callback when this attempt succeeds.
    pub fn connect(&self, once: Option<Box<dyn FnOnce() + Send>>) -> Result<()> {
        let request = self.request()?;

        let attempt = {
            let mut state = self.lock();
            let attempt = begin_attempt(&mut state)?;
            state.suppressed = false;
            attempt
        };

        tokio::spawn(self.clone().run_connection(attempt, request, once));
        Ok(())
    }

    /// Start the reconnect scheduled after attempt `after`
    ///
    /// Skipped when reconnects were suppressed or any attempt started since.
    fn reconnect(&self, after: u64) {
        let request = match self.request() {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Reconnect skipped");
                return;
            }
        };

        let attempt = {
            let mut state = self.lock();
            if state.attempt != after {
                tracing::trace!(after, "Ignoring stale reconnect timer");
                return;
            }
            state.retry = None;
            if state.suppressed {
                tracing::debug!("Reconnect suppressed by disconnect");
                return;
            }
            match begin_attempt(&mut state) {
                Ok(attempt) => attempt,
                Err(e) => {
                    tracing::debug!(error = %e, "Reconnect skipped");
                    return;
                }
            }
        };

        tokio::spawn(self.clone().run_connection(attempt, request, None));
    }

    /// Close the connection without triggering a reconnect
    ///
    /// Cancels a pending reconnect. Idempotent; no callback fires.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.suppressed = true;
        if let Some(retry) = state.retry.take() {
            retry.abort();
        }
        state.active = None;
        let previous = std::mem::replace(&mut state.status, ConnectionStatus::Closed);
        if let Some(outbound) = state.outbound.take() {
            let _ = outbound.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "disconnected".into(),
            })));
        }
        if previous != ConnectionStatus::Closed {
            tracing::info!(
                identity = %self.shared.settings.identity,
                "Disconnected from controller"
            );
        }
    }

    /// Queue a text frame on the open connection
    pub fn send_text(&self, text: String) -> Result<()> {
        let state = self.lock();
        match (&state.status, &state.outbound) {
            (ConnectionStatus::Open, Some(outbound)) => outbound
                .send(Message::Text(text))
                .map_err(|_| Error::NotConnected),
            _ => Err(Error::NotConnected),
        }
    }

    async fn run_connection(
        self,
        attempt: u64,
        request: Request,
        once: Option<Box<dyn FnOnce() + Send>>,
    ) {
        let settings = &self.shared.settings;
        tracing::debug!(
            url = %settings.url,
            identity = %settings.identity,
            attempt,
            "Connecting to controller"
        );

        let mut ws = match connect_async(request).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                tracing::warn!(url = %settings.url, attempt, error = %e, "Connection failed");
                self.closed(attempt, CloseInfo::abnormal(e.to_string()));
                return;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let attached = {
            let mut state = self.lock();
            if state.active == Some(attempt) {
                state.status = ConnectionStatus::Open;
                state.outbound = Some(tx);
                true
            } else {
                false
            }
        };
        if !attached {
            tracing::debug!(attempt, "Connection detached while connecting");
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "disconnected".into(),
                }))
                .await;
            return;
        }

        tracing::info!(
            url = %settings.url,
            identity = %settings.identity,
            attempt,
            "Connected to controller"
        );
        if let Some(callback) = &settings.on_connected {
            callback();
        }
        if let Some(callback) = once {
            callback();
        }

        let (mut sink, mut stream) = ws.split();
        let close = loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(message) => {
                        let closing = matches!(message, Message::Close(_));
                        if let Err(e) = sink.send(message).await {
                            tracing::warn!(attempt, error = %e, "Failed to write frame");
                            break CloseInfo::abnormal(e.to_string());
                        }
                        if closing {
                            break CloseInfo::new(NORMAL_CLOSURE, "disconnected");
                        }
                    }
                    None => break CloseInfo::new(NORMAL_CLOSURE, "disconnected"),
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text),
                    Some(Ok(Message::Close(frame))) => {
                        self.closing(attempt);
                        let _ = sink.close().await;
                        break match frame {
                            Some(frame) => CloseInfo::new(u16::from(frame.code), frame.reason.to_string()),
                            None => CloseInfo::new(NO_STATUS, ""),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(attempt, error = %e, "Connection error");
                        break CloseInfo::abnormal(e.to_string());
                    }
                    None => break CloseInfo::abnormal("connection dropped"),
                },
            }
        };

        self.closed(attempt, close);
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<ControlMessage>(text) {
            Ok(message) => {
                tracing::debug!(?message, "Received control message");
                (self.shared.handler)(message);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed control message");
            }
        }
    }

    fn closing(&self, attempt: u64) {
        let mut state = self.lock();
        if state.active == Some(attempt) {
            state.status = ConnectionStatus::Closing;
            state.outbound = None;
        }
    }

    fn closed(&self, attempt: u64, close: CloseInfo) {
        let retry = {
            let mut state = self.lock();
            if state.active != Some(attempt) {
                tracing::trace!(attempt, "Ignoring close of a detached connection");
                return;
            }
            state.active = None;
            state.status = ConnectionStatus::Closed;
            state.outbound = None;
            !close.is_normal() && self.shared.settings.auto_retry && !state.suppressed
        };

        if close.is_normal() {
            tracing::info!(attempt, %close, "Connection closed");
        } else {
            tracing::warn!(attempt, %close, retry, "Connection lost");
        }

        if let Some(callback) = &self.shared.settings.on_disconnected {
            callback(&close);
        }

        // The callback may have called `disconnect()` or `connect()`
        if retry {
            self.schedule_retry();
        }
    }

    fn schedule_retry(&self) {
        let mut state = self.lock();
        if state.suppressed
            || state.status != ConnectionStatus::Closed
            || state.retry.is_some()
        {
            return;
        }

        let delay = self.shared.settings.retry_delay;
        let after = state.attempt;
        tracing::debug!(delay_ms = delay.as_millis() as u64, after, "Scheduling reconnect");

        let manager = self.clone();
        state.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.reconnect(after);
        }));
    }
}

/// Claim the next attempt number; fails while connecting or connected
fn begin_attempt(state: &mut State) -> Result<u64> {
    if matches!(
        state.status,
        ConnectionStatus::Connecting | ConnectionStatus::Open
    ) {
        return Err(Error::AlreadyConnected);
    }
    if let Some(retry) = state.retry.take() {
        retry.abort();
    }
    state.attempt += 1;
    state.active = Some(state.attempt);
    state.status = ConnectionStatus::Connecting;
    Ok(state.attempt)
}
