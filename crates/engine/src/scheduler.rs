//! Deferred command scheduling for one session.
//!
//! The scheduler owns the session's task group and cancellation token. Every
//! piece of work the session runs (top-level command processing as well as
//! deferred resubmissions) is spawned here, so closing the session can cancel
//! the timers that have not fired yet and then wait for everything else.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;

use turnstile_domain::SessionId;

pub struct CommandScheduler {
    session_id: SessionId,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl CommandScheduler {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn in-flight work into the session's task group.
    ///
    /// The task is not cancelled on close; close waits for it instead.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Run `resubmit` once `delay` has elapsed.
    ///
    /// Resolves to `None` without running `resubmit` if the session is
    /// cancelled first, including when cancellation and the timer race.
    pub fn schedule<F, T>(&self, delay: Duration, resubmit: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = Option<T>> + Send + 'static,
        T: Send + 'static,
    {
        let cancel = self.cancel.clone();
        let session_id = self.session_id;
        tracing::debug!(session_id = %session_id, delay_ms = delay.as_millis() as u64, "Deferred command scheduled");
        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(session_id = %session_id, "Deferred command abandoned");
                    None
                }
                _ = tokio::time::sleep(delay) => {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    resubmit.await
                }
            }
        })
    }

    /// Wait for every scheduled task, returning results in declaration order.
    ///
    /// A task that panicked contributes `None`.
    pub async fn fan_in<T>(&self, handles: Vec<JoinHandle<Option<T>>>) -> Vec<Option<T>> {
        let results = futures_util::future::join_all(handles).await;
        results
            .into_iter()
            .map(|result| match result {
                Ok(value) => value,
                Err(e) => {
                    tracing::error!(
                        session_id = %self.session_id,
                        error = %e,
                        "Deferred command task failed"
                    );
                    None
                }
            })
            .collect()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the session starts closing.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Number of tasks still running in the session's group.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel unfired deferred work and wait for every remaining task.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
