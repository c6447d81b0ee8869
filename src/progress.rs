//! Progress event emission.
//!
//! Resolution reports start/complete events keyed by an operation id
//! string ("resolve <ref>"), optionally attributed to the build-graph
//! vertex that requested the work. Rendering is out of scope; the
//! default sink forwards to `tracing`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives start/complete events for long-running operations.
pub trait ProgressSink: Send + Sync {
    /// An operation started.
    fn started(&self, id: &str);

    /// An operation completed; `error` is set when it failed.
    fn completed(&self, id: &str, error: Option<&str>);
}

/// Default sink that logs events through `tracing`.
#[derive(Debug, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn started(&self, id: &str) {
        debug!("{} started", id);
    }

    fn completed(&self, id: &str, error: Option<&str>) {
        match error {
            Some(e) => warn!("{} failed: {}", id, e),
            None => debug!("{} done", id),
        }
    }
}

/// The build-graph vertex an operation is performed for.
#[derive(Debug, Clone)]
pub struct Vertex {
    /// Vertex digest.
    pub digest: String,
    /// Human-readable vertex name.
    pub name: String,
}

/// Progress attribution shared by every layer descriptor of one pull.
#[derive(Clone)]
pub struct ProgressController {
    /// Event sink.
    pub sink: Arc<dyn ProgressSink>,
    /// Digest of the requesting vertex, when known.
    pub vertex_digest: Option<String>,
    /// Name of the requesting vertex, when known.
    pub vertex_name: Option<String>,
}

impl std::fmt::Debug for ProgressController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressController")
            .field("vertex_digest", &self.vertex_digest)
            .field("vertex_name", &self.vertex_name)
            .finish()
    }
}

/// Start/complete pair for one operation; completion fires exactly once
/// no matter how many exit paths call [`OneOff::finish`].
pub struct OneOff {
    sink: Arc<dyn ProgressSink>,
    id: String,
    finished: AtomicBool,
}

impl OneOff {
    /// Emits the start event and returns the completion handle.
    pub fn start(sink: Arc<dyn ProgressSink>, id: impl Into<String>) -> Self {
        let id = id.into();
        sink.started(&id);
        Self {
            sink,
            id,
            finished: AtomicBool::new(false),
        }
    }

    /// Emits the completion event. Later calls are no-ops.
    pub fn finish(&self, error: Option<&crate::error::Error>) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let msg = error.map(|e| e.to_string());
        self.sink.completed(&self.id, msg.as_deref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ProgressSink for Recorder {
        fn started(&self, id: &str) {
            self.events.lock().unwrap().push(format!("start {}", id));
        }
        fn completed(&self, id: &str, error: Option<&str>) {
            let tag = if error.is_some() { "fail" } else { "done" };
            self.events.lock().unwrap().push(format!("{} {}", tag, id));
        }
    }

    #[test]
    fn one_off_completes_exactly_once() {
        let sink = Arc::new(Recorder::default());
        let one_off = OneOff::start(sink.clone(), "resolve alpine:3.18");
        one_off.finish(None);
        one_off.finish(None);

        let events = sink.events.lock().unwrap();
        assert_eq!(
            *events,
            vec!["start resolve alpine:3.18", "done resolve alpine:3.18"]
        );
    }
}
