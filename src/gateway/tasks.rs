use std::fmt::Display;
use std::future::Future;

use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error};

/// Aborts the wrapped task when the guard goes away.
#[derive(Debug)]
pub struct AbortOnDrop(tokio::task::AbortHandle);

impl AbortOnDrop {
    pub fn new(handle: tokio::task::AbortHandle) -> Self {
        Self(handle)
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs accounting work that must outlive the request that started it.
///
/// Tasks are not tied to the caller's cancellation: a client disconnect drops the request future,
/// never the settlement it scheduled. Failures are logged here since nobody awaits the result.
#[derive(Clone, Debug, Default)]
pub struct TaskRunner {
    tracker: TaskTracker,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F, E>(&self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if tokio::runtime::Handle::try_current().is_err() {
            error!(task = name, "no async runtime available; background task dropped");
            return;
        }
        let span = tracing::Span::current();
        self.tracker.spawn(
            async move {
                match task.await {
                    Ok(()) => debug!(task = name, "background task finished"),
                    Err(err) => error!(task = name, error = %err, "background task failed"),
                }
            }
            .instrument(span),
        );
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Waits for every task spawned so far, then accepts new work again.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
