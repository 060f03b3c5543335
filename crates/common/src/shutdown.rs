//! Process-wide shutdown coordination.
//!
//! One cancellation token fans out to every background task (history worker,
//! session dispatchers, reconnect loops). Tasks are spawned on a shared
//! tracker so the process can wait for all of them to observe the signal
//! before exiting.

use std::future::Future;

use {
    tokio::task::JoinHandle,
    tokio_util::{sync::CancellationToken, task::TaskTracker},
    tracing::debug,
};

#[derive(Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// A token cancelled with the process token, or independently.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Signal every task to stop.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Resolves once shutdown has been triggered.
    pub async fn triggered(&self) {
        self.token.cancelled().await;
    }

    /// Spawn a tracked background task.
    pub fn spawn<F>(&self, name: &'static str, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(async move {
            fut.await;
            debug!(task = name, "background task exited");
        })
    }

    /// Number of tracked tasks still running.
    pub fn running(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting new tasks and wait for the running ones to exit.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
