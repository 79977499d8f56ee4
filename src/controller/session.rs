//! Per-connection run state on the controller side
//!
//! Tracks whether a run was requested and whether its events are flowing,
//! and folds the decoded event stream of one run into a [`RunSummary`].

use crate::codec::{DecodedEvent, Graph, NodeId, Value};
use crate::protocol::EventName;

/// Run state of one endpoint connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// No run requested or the last one ended
    Idle,
    /// Run requested, `start` not seen yet
    Requested,
    /// Events are flowing
    Running,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Requested => write!(f, "requested"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Run bookkeeping for one connection
#[derive(Debug, Clone)]
pub struct RunTracker {
    phase: RunPhase,
    requested: u64,
    completed: u64,
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            phase: RunPhase::Idle,
            requested: 0,
            completed: 0,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Number of runs requested on this connection
    pub fn requested(&self) -> u64 {
        self.requested
    }

    /// Number of runs that reached `end`
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Record a run request; returns false while a run is in flight
    pub fn request(&mut self) -> bool {
        if self.phase != RunPhase::Idle {
            return false;
        }
        self.requested += 1;
        self.phase = RunPhase::Requested;
        true
    }

    /// Give up on the run in flight, e.g. when its `end` never arrived
    ///
    /// Returns the phase that was abandoned.
    pub fn abandon(&mut self) -> RunPhase {
        std::mem::replace(&mut self.phase, RunPhase::Idle)
    }

    /// Advance on an incoming event
    pub fn observe(&mut self, name: EventName) {
        match name {
            EventName::Start => self.phase = RunPhase::Running,
            EventName::End => {
                self.phase = RunPhase::Idle;
                self.completed += 1;
            }
            _ if self.phase == RunPhase::Idle => {
                tracing::debug!(event = %name, "Event outside of a requested run");
            }
            _ => {}
        }
    }
}

/// A failed test as reported by the endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    /// Suite titles and test title, outermost first
    pub title: String,
    pub error_name: Option<String>,
    pub message: Option<String>,
    pub stack: Option<String>,
}

/// Outcome of one run, folded from its events
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Every event name in arrival order
    pub events: Vec<EventName>,
    pub tests: usize,
    pub passes: usize,
    pub pending: usize,
    /// Number of `fail` events
    pub failures: usize,
    /// Failure count carried by the `end` event, when present
    pub reported_failures: Option<u64>,
    pub duration_ms: Option<u64>,
    pub failed: Vec<FailureReport>,
}

impl RunSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the summary
    pub fn record(&mut self, event: &DecodedEvent) {
        self.events.push(event.name);
        match event.name {
            EventName::Test => self.tests += 1,
            EventName::Pass => self.passes += 1,
            EventName::Pending => self.pending += 1,
            EventName::Fail => {
                self.failures += 1;
                self.failed.push(failure_report(event));
            }
            EventName::End => {
                if let Some(stats) = event.subject() {
                    self.reported_failures =
                        event.graph.get(stats, "failures").and_then(Value::as_u64);
                    self.duration_ms = event.graph.get(stats, "duration").and_then(Value::as_u64);
                }
            }
            _ => {}
        }
    }

    /// Whether the `end` event has been recorded
    pub fn is_complete(&self) -> bool {
        self.events.last() == Some(&EventName::End)
    }

    pub fn passed(&self) -> bool {
        self.failures == 0
    }
}

fn failure_report(event: &DecodedEvent) -> FailureReport {
    let graph = &event.graph;
    let title = event
        .subject()
        .map(|test| full_title(graph, test))
        .unwrap_or_default();
    let error = event.args.get(1).and_then(Value::as_node);
    let field = |key: &str| error.and_then(|e| graph.get_str(e, key)).map(str::to_string);
    FailureReport {
        title,
        error_name: field("name"),
        message: field("message"),
        stack: field("stack"),
    }
}

/// Join the titles from the outermost suite down to `node`
///
/// Empty titles (the root suite) are skipped; cycles in the parent chain
/// stop the walk.
pub fn full_title(graph: &Graph, node: NodeId) -> String {
    let mut titles = Vec::new();
    let mut seen = Vec::new();
    let mut current = Some(node);
    while let Some(id) = current {
        if seen.contains(&id) {
            break;
        }
        seen.push(id);
        if let Some(title) = graph.get_str(id, "title").filter(|t| !t.is_empty()) {
            titles.push(title);
        }
        current = graph.get(id, "parent").and_then(Value::as_node);
    }
    titles.reverse();
    titles.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: EventName, graph: Graph, args: Vec<Value>) -> DecodedEvent {
        DecodedEvent { name, graph, args }
    }

    fn test_graph() -> (Graph, NodeId, NodeId) {
        let mut graph = Graph::new();
        let root = graph.add_map();
        graph.set(root, "title", "").unwrap();
        let suite = graph.add_map();
        graph.set(suite, "title", "math").unwrap();
        graph.set(suite, "parent", root).unwrap();
        let test = graph.add_map();
        graph.set(test, "title", "adds").unwrap();
        graph.set(test, "parent", suite).unwrap();
        let error = graph.add_map();
        graph.set(error, "name", "AssertionError").unwrap();
        graph.set(error, "message", "expected 1 to equal 2").unwrap();
        (graph, test, error)
    }

    #[test]
    fn test_tracker_phases() {
        let mut tracker = RunTracker::new();
        assert!(tracker.request());
        assert!(!tracker.request());
        assert_eq!(tracker.phase(), RunPhase::Requested);

        tracker.observe(EventName::Start);
        assert_eq!(tracker.phase(), RunPhase::Running);
        tracker.observe(EventName::Pass);
        tracker.observe(EventName::End);
        assert_eq!(tracker.phase(), RunPhase::Idle);
        assert_eq!(tracker.completed(), 1);
        assert!(tracker.request());
        assert_eq!(tracker.requested(), 2);
    }

    #[test]
    fn test_abandoned_run_allows_a_new_request() {
        let mut tracker = RunTracker::new();
        assert!(tracker.request());
        assert_eq!(tracker.abandon(), RunPhase::Requested);
        assert_eq!(tracker.phase(), RunPhase::Idle);
        assert!(tracker.request());
        assert_eq!(tracker.completed(), 0);
        assert_eq!(tracker.abandon(), RunPhase::Requested);
        assert_eq!(tracker.abandon(), RunPhase::Idle);
    }

    #[test]
    fn test_full_title_skips_root() {
        let (graph, test, _) = test_graph();
        assert_eq!(full_title(&graph, test), "math adds");
    }

    #[test]
    fn test_full_title_stops_on_cycle() {
        let mut graph = Graph::new();
        let a = graph.add_map();
        let b = graph.add_map();
        graph.set(a, "title", "a").unwrap();
        graph.set(a, "parent", b).unwrap();
        graph.set(b, "title", "b").unwrap();
        graph.set(b, "parent", a).unwrap();
        assert_eq!(full_title(&graph, a), "b a");
    }

    #[test]
    fn test_summary_counts_and_failures() {
        let (graph, test, error) = test_graph();
        let mut summary = RunSummary::new();
        summary.record(&event(EventName::Start, Graph::new(), vec![]));
        summary.record(&event(EventName::Test, graph.clone(), vec![test.into()]));
        summary.record(&event(
            EventName::Fail,
            graph.clone(),
            vec![test.into(), error.into()],
        ));
        assert!(!summary.is_complete());

        let mut stats_graph = Graph::new();
        let stats = stats_graph.add_map();
        stats_graph.set(stats, "failures", 1u64).unwrap();
        stats_graph.set(stats, "duration", 12u64).unwrap();
        summary.record(&event(EventName::End, stats_graph, vec![stats.into()]));

        assert!(summary.is_complete());
        assert!(!summary.passed());
        assert_eq!(summary.tests, 1);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.reported_failures, Some(1));
        assert_eq!(summary.duration_ms, Some(12));
        assert_eq!(
            summary.failed[0],
            FailureReport {
                title: "math adds".to_string(),
                error_name: Some("AssertionError".to_string()),
                message: Some("expected 1 to equal 2".to_string()),
                stack: None,
            }
        );
    }
}
