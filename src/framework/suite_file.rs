//! YAML suite files
//!
//! Describes a [`ScriptedFramework`] declaratively, so an endpoint can be
//! started from the command line without writing Rust:
//!
//! ```yaml
//! suites:
//!   - title: math
//!     hooks: [before_each]
//!     tests:
//!       - title: adds
//!       - title: divides by zero
//!         outcome: fail
//!         error:
//!           name: AssertionError
//!           message: expected Infinity to be finite
//!           fields: { operator: isFinite }
//!       - title: rounds
//!         outcome: pending
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::codec::ErrorInfo;
use crate::common::{Error, Result};

use super::scripted::{HookKind, ScriptedFramework, Suite};

/// A suite as written in the file
#[derive(Debug, Deserialize)]
pub struct SuiteSpec {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub hooks: Vec<HookKind>,
    #[serde(default)]
    pub tests: Vec<TestSpec>,
    #[serde(default)]
    pub suites: Vec<SuiteSpec>,
}

/// A test as written in the file
#[derive(Debug, Deserialize)]
pub struct TestSpec {
    pub title: String,
    #[serde(default)]
    pub outcome: Outcome,
    /// Error reported when the outcome is `fail`
    pub error: Option<ErrorSpec>,
    /// Simulated test duration
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    #[default]
    Pass,
    Fail,
    Pending,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorSpec {
    #[serde(default = "default_error_name")]
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

fn default_error_name() -> String {
    "AssertionError".to_string()
}

impl ErrorSpec {
    fn to_error(&self) -> ErrorInfo {
        let stack = self
            .stack
            .clone()
            .unwrap_or_else(|| format!("{}: {}", self.name, self.message));
        let mut error = ErrorInfo::named(&self.name, &self.message).with_stack(stack);
        for (key, value) in &self.fields {
            error = error.with_field(key.clone(), value.clone());
        }
        error
    }
}

impl SuiteSpec {
    /// Parse a suite tree from YAML text
    pub fn parse(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse suite file: {}", e)))
    }

    /// Load a suite tree from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Build the runnable suite tree
    pub fn build(&self) -> Suite {
        let mut suite = Suite::new(self.title.clone());
        for hook in &self.hooks {
            suite = suite.hook(*hook);
        }
        for test in &self.tests {
            suite = match test.outcome {
                Outcome::Pending => suite.pending(test.title.clone()),
                outcome => {
                    let error = test.error.as_ref().map(ErrorSpec::to_error).unwrap_or_else(|| {
                        ErrorInfo::named("AssertionError", format!("{} failed", test.title))
                    });
                    let duration = test.duration_ms.map(Duration::from_millis);
                    suite.test(test.title.clone(), move || {
                        if let Some(duration) = duration {
                            std::thread::sleep(duration);
                        }
                        match outcome {
                            Outcome::Fail => Err(error.clone()),
                            _ => Ok(()),
                        }
                    })
                }
            };
        }
        for child in &self.suites {
            suite = suite.suite(child.build());
        }
        suite
    }

    /// Build a framework running this tree
    pub fn framework(&self) -> ScriptedFramework {
        ScriptedFramework::new(self.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::{EventName, Runner, TestFramework};
    use std::sync::{Arc, Mutex};

    const SUITE: &str = r#"
suites:
  - title: math
    hooks: [before_each]
    tests:
      - title: adds
      - title: divides
        outcome: fail
        error:
          message: expected 1 to equal 2
          fields: { expected: 2, actual: 1 }
      - title: rounds
        outcome: pending
"#;

    #[test]
    fn test_parse_defaults() {
        let spec = SuiteSpec::parse(SUITE).unwrap();
        assert_eq!(spec.title, "");
        let math = &spec.suites[0];
        assert_eq!(math.hooks, vec![HookKind::BeforeEach]);
        assert_eq!(math.tests[0].outcome, Outcome::Pass);
        assert_eq!(math.tests[1].error.as_ref().unwrap().name, "AssertionError");
    }

    #[test]
    fn test_built_framework_reports_declared_outcomes() {
        let spec = SuiteSpec::parse(SUITE).unwrap();
        let mut framework = spec.framework();
        let mut runner = Runner::new();
        let names = Arc::new(Mutex::new(Vec::new()));
        for name in [EventName::Pass, EventName::Fail, EventName::Pending] {
            let names = names.clone();
            runner.on(name, move |event| {
                names.lock().unwrap().push(event.name);
                Ok(())
            });
        }

        framework.run(&mut runner).unwrap();

        assert_eq!(
            *names.lock().unwrap(),
            vec![EventName::Pass, EventName::Fail, EventName::Pending]
        );
        assert_eq!(runner.failures(), 1);
    }

    #[test]
    fn test_compound_fields_are_kept_structured() {
        let spec = SuiteSpec::parse(
            "tests:\n  - title: sorts\n    outcome: fail\n    error:\n      message: wrong order\n      fields: { expected: [1, 2], actual: { first: 2 } }\n",
        )
        .unwrap();
        let error = spec.tests[0].error.as_ref().unwrap().to_error();
        assert_eq!(error.fields["expected"], serde_json::json!([1, 2]));
        assert_eq!(error.fields["actual"], serde_json::json!({ "first": 2 }));
    }

    #[test]
    fn test_unknown_outcome_is_rejected() {
        let err = SuiteSpec::parse("tests:\n  - title: x\n    outcome: flaky\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
