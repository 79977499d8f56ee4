//! Reporter forwarding every lifecycle event to the controller

use std::sync::Arc;

use crate::common::Result;
use crate::framework::{EventName, Runner, RunnerEvent};

type Sink = Arc<dyn Fn(&RunnerEvent) -> Result<()> + Send + Sync>;

/// Attaches one listener per event name, each forwarding into `sink`
pub struct RemoteReporter {
    sink: Sink,
}

impl RemoteReporter {
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(&RunnerEvent) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn install(&self, runner: &mut Runner) {
        for name in EventName::ALL {
            let sink = self.sink.clone();
            runner.on(name, move |event| {
                tracing::trace!(event = %name, "Forwarding event");
                sink(event)
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Graph;
    use std::sync::Mutex;

    #[test]
    fn test_forwards_every_event_in_order() {
        let forwarded = Arc::new(Mutex::new(Vec::new()));
        let sink = forwarded.clone();
        let reporter = RemoteReporter::new(move |event: &RunnerEvent| {
            sink.lock().unwrap().push(event.name);
            Ok(())
        });

        let mut runner = Runner::new();
        reporter.install(&mut runner);
        for name in EventName::ALL {
            runner
                .emit(RunnerEvent::new(name, Graph::new(), Vec::new()))
                .unwrap();
        }

        assert_eq!(*forwarded.lock().unwrap(), EventName::ALL.to_vec());
    }
}
