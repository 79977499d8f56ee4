//! Session endpoint - the side that owns and runs the test framework
//!
//! The endpoint connects to a controller, waits for `{"type": "run"}` and
//! streams every lifecycle event of the resulting run back over the same
//! connection. It never starts a run on its own.

pub mod connection;
mod reporter;
pub mod shim;

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::codec;
use crate::common::{Error, Result};
use crate::framework::{FrameworkFactory, RunnerEvent, TestFramework};
use crate::protocol::{CloseInfo, ControlMessage, DEFAULT_IDENTITY};

use connection::{ConnectionManager, ConnectionSettings};
use reporter::RemoteReporter;
use shim::Shim;

pub use connection::ConnectionStatus;
pub use shim::{FrameworkInstance, RunHandle, RunState};

/// Endpoint configuration, fixed once the endpoint is built
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Controller URL
    pub url: String,
    /// Session identity, sent as the WebSocket sub-protocol
    pub id: String,
    /// Connect as soon as the endpoint is built
    pub auto_connect: bool,
    /// Reconnect after an abnormal close
    pub auto_retry: bool,
    /// Delay before each reconnect attempt
    pub retry_delay: Duration,
    /// Passed verbatim to the framework factory
    pub framework_options: serde_json::Value,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8090".to_string(),
            id: DEFAULT_IDENTITY.to_string(),
            auto_connect: true,
            auto_retry: true,
            retry_delay: Duration::from_millis(500),
            framework_options: serde_json::Value::Null,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Notifications raised by the endpoint
#[derive(Clone, Default)]
pub struct Callbacks {
    connected: Option<Arc<dyn Fn() + Send + Sync>>,
    disconnected: Option<Arc<dyn Fn(&CloseInfo) + Send + Sync>>,
    instrumented: Option<Arc<dyn Fn() + Send + Sync>>,
    running: Option<Arc<dyn Fn(&RunHandle) + Send + Sync>>,
}

impl Callbacks {
    pub fn on_connected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.connected = Some(Arc::new(f));
        self
    }

    pub fn on_disconnected(mut self, f: impl Fn(&CloseInfo) + Send + Sync + 'static) -> Self {
        self.disconnected = Some(Arc::new(f));
        self
    }

    pub fn on_instrumented(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.instrumented = Some(Arc::new(f));
        self
    }

    pub fn on_running(mut self, f: impl Fn(&RunHandle) + Send + Sync + 'static) -> Self {
        self.running = Some(Arc::new(f));
        self
    }
}

struct Inner {
    config: ClientConfig,
    callbacks: Callbacks,
    connection: ConnectionManager,
    shim: Mutex<Shim>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.connection.disconnect();
    }
}

/// A session endpoint
///
/// Must be built inside a Tokio runtime: connecting and running spawn tasks.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Build an endpoint, connecting right away when `auto_connect` is set
    ///
    /// `factory` builds a framework whenever a run is requested and no
    /// instrumented instance is waiting.
    pub fn new(config: ClientConfig, callbacks: Callbacks, factory: FrameworkFactory) -> Result<Self> {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let settings = ConnectionSettings {
                url: config.url.clone(),
                identity: config.id.clone(),
                auto_retry: config.auto_retry,
                retry_delay: config.retry_delay,
                on_connected: callbacks.connected.clone(),
                on_disconnected: callbacks.disconnected.clone(),
            };
            let handler = Box::new(move |message: ControlMessage| {
                if let Some(inner) = weak.upgrade() {
                    Client { inner }.handle_message(message);
                }
            });
            Inner {
                connection: ConnectionManager::new(settings, handler),
                shim: Mutex::new(Shim::new(factory, config.framework_options.clone())),
                config,
                callbacks,
            }
        });
        inner.connection.validate()?;

        let client = Self { inner };
        if client.inner.config.auto_connect {
            client.connect()?;
        }
        Ok(client)
    }

    fn shim(&self) -> MutexGuard<'_, Shim> {
        self.inner
            .shim
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn identity(&self) -> &str {
        &self.inner.config.id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.connection.status()
    }

    /// Number of connection attempts made so far, reconnects included
    pub fn attempts(&self) -> u64 {
        self.inner.connection.attempts()
    }

    /// Connect to the controller
    ///
    /// Fails with [`Error::AlreadyConnected`] while connecting or connected.
    pub fn connect(&self) -> Result<()> {
        self.inner.connection.connect(None)
    }

    /// Connect, running `f` once this attempt is open
    pub fn connect_then<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.connection.connect(Some(Box::new(f)))
    }

    /// Close the connection and cancel any pending reconnect
    pub fn disconnect(&self) {
        self.inner.connection.disconnect();
    }

    /// Hand a framework to the endpoint for the next run
    ///
    /// Instrumenting again replaces a framework that has not run yet.
    pub fn instrument(&self, framework: Box<dyn TestFramework>) {
        self.shim().instrument(framework);
        self.notify_instrumented();
    }

    /// Whether an instrumented framework is waiting for a run request
    pub fn has_instance(&self) -> bool {
        self.shim().has_instance()
    }

    /// Serialize an event and queue it for the controller
    ///
    /// Fails with [`Error::NotConnected`] when the connection is not open.
    /// Events are never retried: after a reconnect they would interleave
    /// with a newer run.
    pub fn send(&self, event: RunnerEvent) -> Result<()> {
        forward(&self.inner.connection, &event)
    }

    fn handle_message(&self, message: ControlMessage) {
        match message {
            ControlMessage::Run => {
                if let Err(e) = self.start_run() {
                    tracing::warn!(error = %e, "Rejected run request");
                }
            }
            ControlMessage::Unknown => {
                tracing::debug!("Ignoring unsupported control message");
            }
        }
    }

    /// Dispatch a run of the current (or a freshly built) framework
    pub(crate) fn start_run(&self) -> Result<RunHandle> {
        let connection = self.inner.connection.clone();
        let reporter = RemoteReporter::new(move |event: &RunnerEvent| forward(&connection, event));

        let (handle, created) = {
            let mut shim = self.shim();
            shim.ensure_idle()?;
            let (instance, created) = shim.get_or_create_instance()?;
            let handle = shim.run(instance, |runner| reporter.install(runner))?;
            (handle, created)
        };

        if created {
            self.notify_instrumented();
        }
        if let Some(callback) = &self.inner.callbacks.running {
            callback(&handle);
        }
        Ok(handle)
    }

    fn notify_instrumented(&self) {
        if let Some(callback) = &self.inner.callbacks.instrumented {
            callback();
        }
    }
}

fn forward(connection: &ConnectionManager, event: &RunnerEvent) -> Result<()> {
    if connection.status() != ConnectionStatus::Open {
        return Err(Error::NotConnected);
    }
    let name = event.name;
    let text = codec::encode_event(name, &event.graph, &event.args)?;
    tracing::trace!(event = %name, bytes = text.len(), "Sending event");
    connection.send_text(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Graph;
    use crate::framework::scripted::{ScriptedFramework, Suite};
    use crate::framework::EventName;

    fn factory() -> FrameworkFactory {
        Arc::new(|_| {
            Ok(Box::new(ScriptedFramework::new(Suite::new("").test("passes", || Ok(()))))
                as Box<dyn TestFramework>)
        })
    }

    fn offline() -> ClientConfig {
        ClientConfig {
            url: "ws://127.0.0.1:9".to_string(),
            auto_connect: false,
            auto_retry: false,
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.id, "default");
        assert!(config.auto_connect);
        assert!(config.auto_retry);
        assert_eq!(config.retry_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_send_requires_open_connection() {
        let client = Client::new(offline(), Callbacks::default(), factory()).unwrap();
        let event = RunnerEvent::new(EventName::Start, Graph::new(), Vec::new());
        assert!(matches!(client.send(event), Err(Error::NotConnected)));
        assert_eq!(client.status(), ConnectionStatus::Closed);
    }

    #[test]
    fn test_invalid_identity_is_rejected() {
        let config = ClientConfig {
            id: "bad\nidentity".to_string(),
            ..offline()
        };
        let result = Client::new(config, Callbacks::default(), factory());
        assert!(matches!(result, Err(Error::InvalidIdentity(_))));
    }

    #[test]
    fn test_instrument_fires_callback_and_stores_instance() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = count.clone();
        let callbacks = Callbacks::default().on_instrumented(move || {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        let client = Client::new(offline(), callbacks, factory()).unwrap();

        client.instrument(Box::new(ScriptedFramework::new(Suite::new(""))));
        client.instrument(Box::new(ScriptedFramework::new(Suite::new(""))));

        assert!(client.has_instance());
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_without_connection_aborts() {
        let running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = running.clone();
        let callbacks = Callbacks::default().on_running(move |_| {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        let client = Client::new(offline(), callbacks, factory()).unwrap();

        let mut handle = client.start_run().unwrap();
        handle.completed().await;

        assert_eq!(handle.state(), RunState::Completed);
        assert_eq!(running.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!client.has_instance());
    }
}
