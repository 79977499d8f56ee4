//! Scripted test framework
//!
//! Suites, tests and hooks are declared up front; a test body is a closure
//! returning `Err(ErrorInfo)` on failure. Running it emits the usual
//! lifecycle events with suite/test descriptors that point back at their
//! parents, the same shape browser-side frameworks produce.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use crate::codec::{Arg, ErrorInfo, Graph, NodeId};
use crate::common::Result;

use super::{EventName, Runner, RunnerEvent, TestFramework};

/// Body of a test
pub type TestFn = Box<dyn Fn() -> std::result::Result<(), ErrorInfo> + Send + Sync>;

/// Hook kinds, run around tests of the suite that declares them
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    BeforeAll,
    BeforeEach,
    AfterEach,
    AfterAll,
}

impl HookKind {
    fn title(self) -> &'static str {
        match self {
            Self::BeforeAll => "\"before all\" hook",
            Self::BeforeEach => "\"before each\" hook",
            Self::AfterEach => "\"after each\" hook",
            Self::AfterAll => "\"after all\" hook",
        }
    }
}

/// A single test; no body means pending
pub struct TestCase {
    pub title: String,
    body: Option<TestFn>,
}

/// A suite of tests and nested suites
#[derive(Default)]
pub struct Suite {
    pub title: String,
    pub hooks: Vec<HookKind>,
    pub tests: Vec<TestCase>,
    pub suites: Vec<Suite>,
}

impl Suite {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn test<F>(mut self, title: impl Into<String>, body: F) -> Self
    where
        F: Fn() -> std::result::Result<(), ErrorInfo> + Send + Sync + 'static,
    {
        self.tests.push(TestCase {
            title: title.into(),
            body: Some(Box::new(body)),
        });
        self
    }

    pub fn pending(mut self, title: impl Into<String>) -> Self {
        self.tests.push(TestCase {
            title: title.into(),
            body: None,
        });
        self
    }

    pub fn hook(mut self, kind: HookKind) -> Self {
        self.hooks.push(kind);
        self
    }

    pub fn suite(mut self, suite: Suite) -> Self {
        self.suites.push(suite);
        self
    }

    fn has_hook(&self, kind: HookKind) -> bool {
        self.hooks.contains(&kind)
    }
}

/// Framework running a declared suite tree
pub struct ScriptedFramework {
    root: Suite,
    reporter: Option<String>,
}

impl ScriptedFramework {
    /// Create a framework around a root suite (conventionally untitled)
    pub fn new(root: Suite) -> Self {
        Self {
            root,
            reporter: None,
        }
    }

    /// Reporter name last selected through the native entry point
    pub fn reporter(&self) -> Option<&str> {
        self.reporter.as_deref()
    }
}

impl TestFramework for ScriptedFramework {
    fn run(&mut self, runner: &mut Runner) -> Result<()> {
        let mut graph = Graph::new();
        let root = describe_suite(&mut graph, &self.root, None, true)?;

        let mut execution = Execution {
            graph: Arc::new(graph),
            runner,
            stats: Stats::default(),
            started: Instant::now(),
        };

        execution.emit(EventName::Start, Vec::new())?;
        execution.run_suite(&self.root, &root)?;
        execution.finish()
    }

    fn set_reporter(&mut self, name: &str) {
        self.reporter = Some(name.to_string());
    }
}

/// Node ids of a suite's descriptor and of its children, mirroring the tree
struct SuiteNodes {
    suite: NodeId,
    tests: Vec<NodeId>,
    suites: Vec<SuiteNodes>,
}

fn describe_suite(
    graph: &mut Graph,
    suite: &Suite,
    parent: Option<NodeId>,
    root: bool,
) -> Result<SuiteNodes> {
    let node = graph.add_map();
    let tests_list = graph.add_list();
    let suites_list = graph.add_list();
    graph.set(node, "title", suite.title.as_str())?;
    graph.set(node, "root", root)?;
    graph.set(node, "parent", parent)?;
    graph.set(node, "tests", tests_list)?;
    graph.set(node, "suites", suites_list)?;

    let mut tests = Vec::with_capacity(suite.tests.len());
    for case in &suite.tests {
        let test = graph.add_map();
        graph.set(test, "title", case.title.as_str())?;
        graph.set(test, "type", "test")?;
        graph.set(test, "parent", node)?;
        graph.set(test, "pending", case.body.is_none())?;
        graph.set(test, "state", None::<String>)?;
        graph.push(tests_list, test)?;
        tests.push(test);
    }

    let mut suites = Vec::with_capacity(suite.suites.len());
    for child in &suite.suites {
        let nodes = describe_suite(graph, child, Some(node), false)?;
        graph.push(suites_list, nodes.suite)?;
        suites.push(nodes);
    }

    Ok(SuiteNodes {
        suite: node,
        tests,
        suites,
    })
}

#[derive(Default)]
struct Stats {
    suites: usize,
    tests: usize,
    passes: usize,
    pending: usize,
}

struct Execution<'r> {
    graph: Arc<Graph>,
    runner: &'r mut Runner,
    stats: Stats,
    started: Instant,
}

impl Execution<'_> {
    /// Descriptors handed out with earlier events stay as they were
    fn graph_mut(&mut self) -> &mut Graph {
        Arc::make_mut(&mut self.graph)
    }

    fn emit(&mut self, name: EventName, args: Vec<Arg>) -> Result<()> {
        self.runner
            .emit(RunnerEvent::new(name, self.graph.clone(), args))
    }

    fn run_suite(&mut self, suite: &Suite, nodes: &SuiteNodes) -> Result<()> {
        self.stats.suites += 1;
        self.emit(EventName::Suite, vec![nodes.suite.into()])?;

        if suite.has_hook(HookKind::BeforeAll) {
            self.run_hook(HookKind::BeforeAll, nodes.suite)?;
        }

        for (case, &test) in suite.tests.iter().zip(nodes.tests.iter()) {
            self.run_test(suite, case, test, nodes.suite)?;
        }

        for (child, child_nodes) in suite.suites.iter().zip(nodes.suites.iter()) {
            self.run_suite(child, child_nodes)?;
        }

        if suite.has_hook(HookKind::AfterAll) {
            self.run_hook(HookKind::AfterAll, nodes.suite)?;
        }

        self.emit(EventName::SuiteEnd, vec![nodes.suite.into()])
    }

    fn run_test(&mut self, suite: &Suite, case: &TestCase, test: NodeId, parent: NodeId) -> Result<()> {
        let Some(body) = &case.body else {
            self.stats.pending += 1;
            self.graph_mut().set(test, "state", "pending")?;
            self.emit(EventName::Pending, vec![test.into()])?;
            return self.emit(EventName::TestEnd, vec![test.into()]);
        };

        self.stats.tests += 1;
        if suite.has_hook(HookKind::BeforeEach) {
            self.run_hook(HookKind::BeforeEach, parent)?;
        }

        self.emit(EventName::Test, vec![test.into()])?;

        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "test panicked".to_string());
            Err(ErrorInfo::named("Panic", message))
        });
        self.graph_mut()
            .set(test, "duration", started.elapsed().as_millis() as u64)?;

        match outcome {
            Ok(()) => {
                self.stats.passes += 1;
                self.graph_mut().set(test, "state", "passed")?;
                self.emit(EventName::Pass, vec![test.into()])?;
            }
            Err(error) => {
                self.graph_mut().set(test, "state", "failed")?;
                tracing::debug!(test = %case.title, error = %error.message, "Test failed");
                self.emit(EventName::Fail, vec![test.into(), error.into()])?;
            }
        }

        self.emit(EventName::TestEnd, vec![test.into()])?;

        if suite.has_hook(HookKind::AfterEach) {
            self.run_hook(HookKind::AfterEach, parent)?;
        }
        Ok(())
    }

    fn run_hook(&mut self, kind: HookKind, parent: NodeId) -> Result<()> {
        let hook = self.graph_mut().add_map();
        self.graph_mut().set(hook, "title", kind.title())?;
        self.graph_mut().set(hook, "type", "hook")?;
        self.graph_mut().set(hook, "parent", parent)?;
        self.emit(EventName::Hook, vec![hook.into()])?;
        self.emit(EventName::HookEnd, vec![hook.into()])
    }

    fn finish(&mut self) -> Result<()> {
        let failures = self.runner.failures();
        let duration = self.started.elapsed().as_millis() as u64;
        let graph = Arc::make_mut(&mut self.graph);
        let stats = graph.add_map();
        graph.set(stats, "suites", self.stats.suites)?;
        graph.set(stats, "tests", self.stats.tests)?;
        graph.set(stats, "passes", self.stats.passes)?;
        graph.set(stats, "pending", self.stats.pending)?;
        graph.set(stats, "failures", failures)?;
        graph.set(stats, "duration", duration)?;
        self.emit(EventName::End, vec![stats.into()])
    }
}
