use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::error;

/// Sink for publish-pipeline failures. `push` is fire-and-forget, so errors
/// end up here instead of at the caller.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, message: &str);
}

/// Default reporter: structured error log.
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, message: &str) {
        error!("{message}");
    }
}

/// Wraps a reporter so that sustained failure produces at most one report
/// per rolling window. Everything inside the window is dropped, not queued.
pub(crate) struct ThrottledReporter {
    reporter: Arc<dyn ErrorReporter>,
    window: Duration,
    last_report: Mutex<Option<Instant>>,
}

impl ThrottledReporter {
    pub(crate) fn new(reporter: Arc<dyn ErrorReporter>, window: Duration) -> Self {
        Self {
            reporter,
            window,
            last_report: Mutex::new(None),
        }
    }

    pub(crate) fn report(&self, message: &str) {
        let now = Instant::now();
        {
            let mut last = self
                .last_report
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if last.is_some_and(|at| now.duration_since(at) < self.window) {
                return;
            }
            *last = Some(now);
        }
        self.reporter.report(message);
    }
}
