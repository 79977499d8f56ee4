//! Test framework abstraction
//!
//! The endpoint does not care how tests are defined or executed. It needs a
//! framework with a run entry point and a [`Runner`] it can attach one
//! listener per lifecycle event to. [`scripted::ScriptedFramework`] is the
//! built-in implementation.

pub mod scripted;
pub mod suite_file;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::codec::{Arg, Graph};
use crate::common::Result;

pub use crate::protocol::EventName;

/// A lifecycle event emitted by a framework
#[derive(Debug, Clone)]
pub struct RunnerEvent {
    pub name: EventName,
    /// Snapshot of every descriptor the arguments may reference, shared
    /// with the framework until it next changes a descriptor
    pub graph: Arc<Graph>,
    pub args: Vec<Arg>,
}

impl RunnerEvent {
    pub fn new(name: EventName, graph: impl Into<Arc<Graph>>, args: Vec<Arg>) -> Self {
        Self {
            name,
            graph: graph.into(),
            args,
        }
    }
}

/// Callback attached to one event name
pub type Listener = Box<dyn FnMut(&RunnerEvent) -> Result<()> + Send>;

/// Event hub handed to a framework for the duration of one run
pub struct Runner {
    listeners: Vec<(EventName, Listener)>,
    failures: Arc<AtomicUsize>,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Attach a listener for one event name
    pub fn on<F>(&mut self, name: EventName, listener: F)
    where
        F: FnMut(&RunnerEvent) -> Result<()> + Send + 'static,
    {
        self.listeners.push((name, Box::new(listener)));
    }

    /// Deliver an event to its listeners in attachment order
    ///
    /// A listener error aborts delivery and is returned to the framework,
    /// which must stop the run: later events would arrive out of order.
    pub fn emit(&mut self, event: RunnerEvent) -> Result<()> {
        if event.name == EventName::Fail {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
        for (name, listener) in self.listeners.iter_mut() {
            if *name == event.name {
                listener(&event)?;
            }
        }
        Ok(())
    }

    /// Number of `fail` events emitted so far
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    pub(crate) fn failure_counter(&self) -> Arc<AtomicUsize> {
        self.failures.clone()
    }
}

/// Native entry points of a test framework
pub trait TestFramework: Send + 'static {
    /// Run every test, emitting lifecycle events through `runner`
    fn run(&mut self, runner: &mut Runner) -> Result<()>;

    /// Select a built-in reporter by name
    fn set_reporter(&mut self, name: &str) {
        let _ = name;
    }
}

/// Builds a fresh framework for a run from the endpoint's framework options
pub type FrameworkFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<Box<dyn TestFramework>> + Send + Sync>;
