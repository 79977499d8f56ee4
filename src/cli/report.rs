//! Spec-style console report of a remote run

use colored::Colorize;

use crate::codec::{DecodedEvent, Value};
use crate::controller::RunSummary;
use crate::protocol::EventName;

/// Prints suites and tests as their events arrive
pub struct SpecReporter {
    quiet: bool,
    depth: usize,
    failures: usize,
}

impl SpecReporter {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            depth: 0,
            failures: 0,
        }
    }

    fn indent(&self) -> String {
        "  ".repeat(self.depth + 1)
    }

    /// Handle one event of the run
    pub fn event(&mut self, event: &DecodedEvent) {
        let title = event
            .subject()
            .and_then(|node| event.graph.get_str(node, "title"))
            .unwrap_or_default();

        match event.name {
            EventName::Suite if !title.is_empty() => {
                if !self.quiet {
                    println!("{}{}", self.indent(), title.bold());
                }
                self.depth += 1;
            }
            EventName::SuiteEnd if !title.is_empty() => {
                self.depth = self.depth.saturating_sub(1);
            }
            EventName::Pass if !self.quiet => {
                let duration = event
                    .subject()
                    .and_then(|node| event.graph.get(node, "duration"))
                    .and_then(Value::as_u64)
                    .filter(|ms| *ms > 0)
                    .map(|ms| format!(" ({}ms)", ms).dimmed().to_string())
                    .unwrap_or_default();
                println!("{}{} {}{}", self.indent(), "✓".green(), title.dimmed(), duration);
            }
            EventName::Fail => {
                self.failures += 1;
                if !self.quiet {
                    println!(
                        "{}{}",
                        self.indent(),
                        format!("{}) {}", self.failures, title).red()
                    );
                }
            }
            EventName::Pending if !self.quiet => {
                println!("{}{}", self.indent(), format!("- {}", title).cyan());
            }
            _ => {}
        }
    }

    /// Print totals and failure details
    pub fn summary(&self, summary: &RunSummary) {
        println!();
        let duration = summary
            .duration_ms
            .map(|ms| format!(" ({}ms)", ms).dimmed().to_string())
            .unwrap_or_default();
        println!(
            "  {}{}",
            format!("{} passing", summary.passes).green(),
            duration
        );
        if summary.pending > 0 {
            println!("  {}", format!("{} pending", summary.pending).cyan());
        }
        if summary.failures > 0 {
            println!("  {}", format!("{} failing", summary.failures).red());
        }

        for (index, failure) in summary.failed.iter().enumerate() {
            println!();
            println!("  {}) {}:", index + 1, failure.title);
            let name = failure.error_name.as_deref().unwrap_or("Error");
            let message = failure.message.as_deref().unwrap_or_default();
            println!("     {}", format!("{}: {}", name, message).red());
            if let Some(stack) = &failure.stack {
                for line in stack.lines().skip(1) {
                    println!("     {}", line.trim().dimmed());
                }
            }
        }

        if let Some(reported) = summary.reported_failures {
            if reported != summary.failures as u64 {
                tracing::warn!(
                    reported,
                    observed = summary.failures,
                    "Endpoint failure count differs from fail events"
                );
            }
        }
        println!();
    }
}
