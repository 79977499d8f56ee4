//! Run instrumentation
//!
//! A framework handed to the endpoint is wrapped in a [`FrameworkInstance`]:
//! its native run entry point refuses to start a run and its reporter entry
//! point only warns. The framework's own entry point stays reachable to the shim
//! alone, which starts it once per run request with the remote reporter
//! installed.
//!
//! An instance is consumed by the run it serves; the next run needs a new
//! one. A run goes from running to completed.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::common::{Error, Result};
use crate::framework::{EventName, FrameworkFactory, Runner, TestFramework};

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Completed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// A framework whose entry points belong to the endpoint
pub struct FrameworkInstance {
    framework: Box<dyn TestFramework>,
}

impl FrameworkInstance {
    /// Native run entry point; runs are requested by the controller instead
    pub fn run(&mut self) -> Result<RunHandle> {
        tracing::warn!("Refusing direct run of an instrumented framework");
        Err(Error::Instrumented)
    }

    /// Native reporter entry point; events always go to the controller
    pub fn set_reporter(&mut self, name: &str) {
        tracing::warn!(
            reporter = %name,
            "Ignoring reporter selection, events are forwarded to the controller"
        );
    }
}

/// Handle to a dispatched run
#[derive(Debug, Clone)]
pub struct RunHandle {
    id: u64,
    failures: Arc<AtomicUsize>,
    state: watch::Receiver<RunState>,
}

impl RunHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == RunState::Running
    }

    /// Wait for the run to complete and return its failure count
    pub async fn completed(&mut self) -> usize {
        let _ = self
            .state
            .wait_for(|state| *state == RunState::Completed)
            .await;
        self.failures()
    }
}

/// Owns the current instrumented instance and the active run
pub(crate) struct Shim {
    factory: FrameworkFactory,
    options: serde_json::Value,
    current: Option<FrameworkInstance>,
    active: Option<RunHandle>,
    runs: u64,
}

impl Shim {
    pub fn new(factory: FrameworkFactory, options: serde_json::Value) -> Self {
        Self {
            factory,
            options,
            current: None,
            active: None,
            runs: 0,
        }
    }

    /// Wrap a framework and make it the current instance
    pub fn instrument(&mut self, framework: Box<dyn TestFramework>) {
        if self.current.is_some() {
            tracing::debug!("Replacing previously instrumented framework");
        }
        self.current = Some(FrameworkInstance { framework });
    }

    pub fn has_instance(&self) -> bool {
        self.current.is_some()
    }

    /// Fail when a run is still in progress
    pub fn ensure_idle(&self) -> Result<()> {
        match &self.active {
            Some(active) if active.is_active() => Err(Error::RunInProgress(active.id())),
            _ => Ok(()),
        }
    }

    /// Take the current instance, building and instrumenting one if needed
    ///
    /// The second value is true when a new instance was instrumented.
    pub fn get_or_create_instance(&mut self) -> Result<(FrameworkInstance, bool)> {
        if let Some(instance) = self.current.take() {
            return Ok((instance, false));
        }
        let framework = (self.factory)(&self.options)?;
        Ok((FrameworkInstance { framework }, true))
    }

    /// Start the framework's own run entry point on a blocking worker
    ///
    /// `install` attaches the reporter's listeners to the run's [`Runner`].
    /// The run counts as completed once `end` is emitted, or when the
    /// framework returns without emitting it.
    pub fn run<F>(&mut self, instance: FrameworkInstance, install: F) -> Result<RunHandle>
    where
        F: FnOnce(&mut Runner),
    {
        self.ensure_idle()?;

        self.runs += 1;
        let id = self.runs;

        let (state_tx, state_rx) = watch::channel(RunState::Running);
        let state_tx = Arc::new(state_tx);
        let on_end = state_tx.clone();

        // Attached first so the run is retired before `end` is queued
        let mut runner = Runner::new();
        runner.on(EventName::End, move |_| {
            on_end.send_replace(RunState::Completed);
            Ok(())
        });
        install(&mut runner);

        let handle = RunHandle {
            id,
            failures: runner.failure_counter(),
            state: state_rx,
        };

        let mut framework = instance.framework;
        tokio::task::spawn_blocking(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| framework.run(&mut runner)))
                .unwrap_or_else(|_| Err(Error::RunFailed("framework panicked".to_string())));
            match outcome {
                Ok(()) => tracing::info!(run = id, failures = runner.failures(), "Run completed"),
                Err(e) => tracing::error!(run = id, error = %e, "Run aborted"),
            }
            state_tx.send_replace(RunState::Completed);
        });

        tracing::info!(run = id, "Run started");
        self.active = Some(handle.clone());
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Graph;
    use crate::framework::RunnerEvent;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Counts how often its run entry point is invoked
    struct CountingFramework {
        calls: Arc<AtomicUsize>,
        delay: Duration,
        fail: bool,
    }

    impl TestFramework for CountingFramework {
        fn run(&mut self, runner: &mut Runner) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            runner.emit(RunnerEvent::new(EventName::Start, Graph::new(), Vec::new()))?;
            std::thread::sleep(self.delay);
            if self.fail {
                runner.emit(RunnerEvent::new(EventName::Fail, Graph::new(), Vec::new()))?;
            }
            runner.emit(RunnerEvent::new(EventName::End, Graph::new(), Vec::new()))
        }
    }

    fn shim(calls: Arc<AtomicUsize>, delay: Duration) -> Shim {
        let factory: FrameworkFactory = Arc::new(move |_| {
            Ok(Box::new(CountingFramework {
                calls: calls.clone(),
                delay,
                fail: true,
            }) as Box<dyn TestFramework>)
        });
        Shim::new(factory, serde_json::Value::Null)
    }

    #[test]
    fn test_direct_run_is_refused() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut shim = shim(calls.clone(), Duration::ZERO);
        let (mut instance, created) = shim.get_or_create_instance().unwrap();

        assert!(created);
        assert!(matches!(instance.run(), Err(Error::Instrumented)));
        instance.set_reporter("spec");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_invokes_framework_entry_point_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut shim = shim(calls.clone(), Duration::ZERO);
        let (instance, _) = shim.get_or_create_instance().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let mut handle = shim
            .run(instance, move |runner| {
                for name in EventName::ALL {
                    let recorder = recorder.clone();
                    runner.on(name, move |event| {
                        recorder.lock().unwrap().push(event.name);
                        Ok(())
                    });
                }
            })
            .unwrap();

        assert_eq!(handle.completed().await, 1);
        // The run is retired before later `end` listeners have run
        for _ in 0..100 {
            if seen.lock().unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventName::Start, EventName::Fail, EventName::End]
        );
        assert_eq!(handle.state(), RunState::Completed);
    }

    #[tokio::test]
    async fn test_overlapping_run_is_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut shim = shim(calls.clone(), Duration::from_millis(200));

        let (first, _) = shim.get_or_create_instance().unwrap();
        let mut handle = shim.run(first, |_| {}).unwrap();

        assert!(matches!(shim.ensure_idle(), Err(Error::RunInProgress(1))));
        let (second, _) = shim.get_or_create_instance().unwrap();
        assert!(matches!(shim.run(second, |_| {}), Err(Error::RunInProgress(1))));

        handle.completed().await;
        assert!(shim.ensure_idle().is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_instrumented_instance_is_reused_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut shim = shim(calls.clone(), Duration::ZERO);
        shim.instrument(Box::new(CountingFramework {
            calls: calls.clone(),
            delay: Duration::ZERO,
            fail: false,
        }));

        assert!(shim.has_instance());
        let (_, created) = shim.get_or_create_instance().unwrap();
        assert!(!created);
        assert!(!shim.has_instance());
        let (_, created) = shim.get_or_create_instance().unwrap();
        assert!(created);
    }
}
