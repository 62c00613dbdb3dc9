//! Dynamic task group driving one read.
//!
//! Every partition task runs inside the group. A task may spawn further tasks
//! while it runs, and it must do so before it returns: the group only resolves
//! once the tracker is closed *and* empty, so a child registered before its
//! parent exits keeps the count from ever touching zero early.

use core::future::Future;
use core::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::ReadError;

#[derive(Clone, Debug)]
pub(crate) struct TaskGroup {
    tracker: TaskTracker,
    cancellation: CancellationToken,
    first_error: Arc<Mutex<Option<ReadError>>>,
}

impl TaskGroup {
    /// Creates a group whose cancellation follows `parent`.
    pub(crate) fn new(parent: &CancellationToken) -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancellation: parent.child_token(),
            first_error: Arc::default(),
        }
    }

    /// Cancelled when the caller cancels or any task fails.
    pub(crate) const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = Result<(), ReadError>> + Send + 'static,
    {
        let group = self.clone();

        let _ignored = self.tracker.spawn(async move {
            let outcome = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => Err(ReadError::Panicked(panic_message(payload.as_ref()))),
            };

            if let Err(err) = outcome {
                group.fail(err);
            }
        });
    }

    fn fail(&self, err: ReadError) {
        let mut first_error = self.first_error.lock();

        if first_error.is_some() {
            debug!(%err, "Discarding error raised after the read already failed");
            return;
        }

        warn!(%err, "Partition failed, cancelling remaining partitions");
        *first_error = Some(err);
        self.cancellation.cancel();
    }

    /// Waits for every task, including ones spawned while waiting, to exit.
    ///
    /// Returns the first error reported by any task.
    pub(crate) async fn wait(self) -> Result<(), ReadError> {
        let _closed = self.tracker.close();
        self.tracker.wait().await;

        self.first_error.lock().take().map_or(Ok(()), Err)
    }
}

fn panic_message(payload: &(dyn core::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
