//! Cancellable lifetime scopes for background tasks.
//!
//! Every long-running loop in Ratewatch (counter ticking, snapshotting) is
//! spawned inside a [`Lifetime`]. Cancelling a lifetime stops every task
//! spawned in it and in its children, and [`Lifetime::shutdown`] waits until
//! they have all returned.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A cancellation scope that tracks the tasks spawned inside it.
#[derive(Debug, Clone, Default)]
pub struct Lifetime {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Lifetime {
    /// Create a new root lifetime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a nested lifetime.
    ///
    /// Cancelling `self` cancels the child, but cancelling the child leaves
    /// `self` running. Shutting down `self` also waits for the child's tasks.
    /// Must be called from within a tokio runtime.
    pub fn child(&self) -> Self {
        let child = Self {
            token: self.token.child_token(),
            tracker: TaskTracker::new(),
        };

        let token = child.token.clone();
        let tracker = child.tracker.clone();
        self.tracker.spawn(async move {
            token.cancelled().await;
            tracker.close();
            tracker.wait().await;
        });

        child
    }

    /// Spawn a task bound to this lifetime.
    ///
    /// The task itself decides when to observe cancellation; it is only
    /// joined, never aborted.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Signal every task in this lifetime (and its children) to stop.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve once this lifetime has been cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// The underlying cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel the lifetime and wait for every tracked task to finish.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
