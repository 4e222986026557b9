//! Session runtime.
//!
//! A session accepts player commands, runs them under the resource locks the
//! rule asks for, publishes the resulting messages and resubmits deferred
//! commands when their timers fire. It ends with exactly one orderly close:
//! unfired timers are cancelled, in-flight commands drain, the terminal
//! message is published and the close callback runs.
//!
//! # Command flow
//!
//! 1. `accept(Command)` is admitted only while the session is open
//! 2. The command runs under its locks; messages are published in order
//! 3. Deferred requests are scheduled and awaited (fan-out/fan-in, recursively)
//! 4. If any branch produced a deferred close, the session closes once its
//!    delay has passed. The command's own deferred close wins over one found
//!    in a child; between siblings the first declared wins.

mod scope;
#[cfg(test)]
mod tests;

pub use scope::SessionScope;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Stream};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use turnstile_domain::{
    CommandRequest, DeferredCommandRequest, LifecycleState, Outgoing, SessionError, SessionId,
};

use crate::locks::ResourceLocks;
use crate::message_bus::MessageBus;
use crate::rule::Rule;
use crate::scheduler::CommandScheduler;

/// Callback run exactly once, after the session has closed.
pub type AfterClose = Box<dyn FnOnce() + Send + 'static>;

/// Request type accepted by a session running rule `R`.
pub type SessionRequest<R> = CommandRequest<<R as Rule>::Player, <R as Rule>::Command>;

/// Result of `SessionHandle::accept` for rule `R`.
pub type AcceptResult<R> = Result<(), SessionError<<R as Rule>::Error>>;

type Deferred<R> = DeferredCommandRequest<<R as Rule>::Player, <R as Rule>::Command>;

/// Stand-in deadline for delays too large to represent. Roughly 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Detached task performing a deferred close.
type Closer<R> = JoinHandle<AcceptResult<R>>;

/// Create a session driven by `rule`. `after_close` runs once the session has
/// fully closed.
pub fn create_session<R, F>(rule: Arc<R>, after_close: F) -> SessionHandle<R>
where
    R: Rule,
    F: FnOnce() + Send + 'static,
{
    SessionHandle::new(SessionId::new(), rule, Box::new(after_close))
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub state: LifecycleState,
    pub created_at: DateTime<Utc>,
    pub published_messages: usize,
}

/// Cheap, cloneable handle to a running session.
pub struct SessionHandle<R: Rule> {
    inner: Arc<SessionInner<R>>,
}

impl<R: Rule> Clone for SessionHandle<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct SessionInner<R: Rule> {
    id: SessionId,
    created_at: DateTime<Utc>,
    rule: Arc<R>,
    locks: ResourceLocks,
    bus: MessageBus<R::Message>,
    scheduler: CommandScheduler,
    lifecycle: watch::Sender<LifecycleState>,
    after_close: Mutex<Option<AfterClose>>,
}

impl<R: Rule> SessionHandle<R> {
    pub fn new(id: SessionId, rule: Arc<R>, after_close: AfterClose) -> Self {
        let (lifecycle, _) = watch::channel(LifecycleState::Open);
        tracing::info!(session_id = %id, "Session created");
        Self {
            inner: Arc::new(SessionInner {
                id,
                created_at: Utc::now(),
                rule,
                locks: ResourceLocks::new(),
                bus: MessageBus::new(),
                scheduler: CommandScheduler::new(id),
                lifecycle,
                after_close: Mutex::new(Some(after_close)),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.state()
    }

    /// Every message published so far.
    pub fn history(&self) -> Vec<R::Message> {
        self.inner.bus.history()
    }

    pub fn published_count(&self) -> usize {
        self.inner.bus.published()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.inner.id,
            state: self.state(),
            created_at: self.inner.created_at,
            published_messages: self.published_count(),
        }
    }

    /// Subscribe to the session's messages from the beginning.
    ///
    /// The stream replays history, follows live messages and ends when the
    /// session closes. Each call starts an independent subscription.
    pub fn messages(&self) -> impl Stream<Item = R::Message> + Send + 'static {
        self.inner.bus.subscribe()
    }

    /// Submit a command or the close sentinel.
    ///
    /// For a command this resolves once the command, every deferred command
    /// it spawned (transitively) and any resulting deferred close are done.
    pub async fn accept(&self, request: SessionRequest<R>) -> AcceptResult<R> {
        match request {
            CommandRequest::CloseSession => self.inner.close().await,
            CommandRequest::Command { player, command } => {
                self.accept_command(player, command).await
            }
        }
    }

    /// Shorthand for `accept(CommandRequest::CloseSession)`.
    pub async fn close(&self) -> AcceptResult<R> {
        self.inner.close().await
    }

    async fn accept_command(&self, player: R::Player, command: R::Command) -> AcceptResult<R> {
        let session_id = self.inner.id;
        let nested = SessionScope::contains(session_id);
        let session = Arc::clone(&self.inner);

        let work = SessionScope::within(session_id, async move {
            let processed = Arc::clone(&session).run_command(player, command).await;
            let outcome: Result<Option<Closer<R>>, SessionError<R::Error>> = match processed {
                Err(e) => Err(SessionError::Domain(e)),
                Ok(None) => Ok(None),
                Ok(Some(_)) if nested => {
                    tracing::warn!(
                        session_id = %session_id,
                        "Deferred close produced by a command running inside its own session"
                    );
                    Err(SessionError::SelfCloseViolation(session_id))
                }
                // Detached from the session's task group: close waits for that group
                Ok(Some(deadline)) => Ok(Some(tokio::spawn(session.close_at(deadline)))),
            };
            outcome
        });

        let Some(processing) = self.inner.admit(work) else {
            tracing::debug!(session_id = %session_id, "Command rejected, session not open");
            return Err(SessionError::AlreadyClosed(session_id));
        };

        if let Some(closer) = joined(session_id, processing.await)? {
            joined(session_id, closer.await)?;
        }
        Ok(())
    }
}

impl<R: Rule> SessionInner<R> {
    fn state(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    /// Spawn `work` into the session's task group if the session is open.
    ///
    /// Runs under the lifecycle lock, so nothing is admitted once a close has
    /// started.
    fn admit<F>(&self, work: F) -> Option<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let mut handle = None;
        self.lifecycle.send_if_modified(|state| {
            if state.is_open() {
                handle = Some(self.scheduler.spawn(work));
            }
            false
        });
        handle
    }

    /// Process one command and everything it defers.
    ///
    /// Resolves to the deadline of the deferred close selected for this
    /// command's subtree, if any.
    fn run_command(
        self: Arc<Self>,
        player: R::Player,
        command: R::Command,
    ) -> BoxFuture<'static, Result<Option<Instant>, R::Error>> {
        async move {
            let session_id = self.id;
            let resources = self.rule.locks_for(&command);
            tracing::trace!(session_id = %session_id, resources = ?resources, "Acquiring resource locks");

            let rule = &self.rule;
            let bus = &self.bus;
            let deferred = self
                .locks
                .use_locks(&resources, || async move {
                    tracing::debug!(
                        session_id = %session_id,
                        player = ?player,
                        command = ?command,
                        "Started processing command"
                    );
                    let outgoing = rule.process(player, command).await?;

                    let mut deferred: Vec<Deferred<R>> = Vec::new();
                    for item in outgoing {
                        match item {
                            Outgoing::Message(message) => {
                                bus.publish(message);
                            }
                            Outgoing::Deferred(request) => deferred.push(request),
                        }
                    }
                    tracing::debug!(
                        session_id = %session_id,
                        deferred = deferred.len(),
                        "Ended processing command"
                    );
                    Ok::<_, R::Error>(deferred)
                })
                .await?;

            Ok::<_, R::Error>(self.resolve_deferred(deferred).await)
        }
        .boxed()
    }

    async fn resolve_deferred(self: &Arc<Self>, deferred: Vec<Deferred<R>>) -> Option<Instant> {
        if deferred.is_empty() {
            return None;
        }

        let produced_at = Instant::now();
        let mut own_close = None;
        let mut children = Vec::new();
        for DeferredCommandRequest { request, delay } in deferred {
            match request {
                CommandRequest::CloseSession => {
                    if own_close.is_none() {
                        own_close = Some(deadline_after(produced_at, delay));
                    } else {
                        tracing::debug!(session_id = %self.id, "Additional deferred close ignored");
                    }
                }
                CommandRequest::Command { player, command } => {
                    let session = Arc::clone(self);
                    let resubmit =
                        SessionScope::within(self.id, session.run_deferred(player, command));
                    children.push(self.scheduler.schedule(delay, resubmit));
                }
            }
        }

        let child_close = self
            .scheduler
            .fan_in(children)
            .await
            .into_iter()
            .flatten()
            .next();

        own_close.or(child_close)
    }

    /// Resubmit a deferred command once its timer has fired.
    async fn run_deferred(self: Arc<Self>, player: R::Player, command: R::Command) -> Option<Instant> {
        let session_id = self.id;
        if !self.state().is_open() {
            tracing::debug!(session_id = %session_id, "Deferred command dropped, session no longer open");
            return None;
        }

        match self.run_command(player, command).await {
            Ok(deferred_close) => deferred_close,
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    error = %e,
                    "Deferred command rejected by rule"
                );
                None
            }
        }
    }

    async fn close_at(self: Arc<Self>, deadline: Instant) -> Result<(), SessionError<R::Error>> {
        tokio::select! {
            biased;
            _ = self.scheduler.cancelled() => {}
            _ = tokio::time::sleep_until(deadline) => {}
        }
        self.close().await
    }

    async fn close(&self) -> Result<(), SessionError<R::Error>> {
        if SessionScope::contains(self.id) {
            tracing::warn!(
                session_id = %self.id,
                "Close requested from within the session's own work, rejecting"
            );
            return Err(SessionError::SelfCloseViolation(self.id));
        }

        let became_closer = self.lifecycle.send_if_modified(|state| {
            if state.can_transition_to(LifecycleState::Closing) {
                *state = LifecycleState::Closing;
                true
            } else {
                false
            }
        });

        if !became_closer {
            let mut lifecycle = self.lifecycle.subscribe();
            // The sender lives in `self`, so this only returns once closed
            let _ = lifecycle.wait_for(|state| state.is_closed()).await;
            tracing::debug!(session_id = %self.id, "Session already closed by another caller");
            return Ok(());
        }

        tracing::info!(
            session_id = %self.id,
            pending_tasks = self.scheduler.pending(),
            "Closing session"
        );
        self.scheduler.shutdown().await;
        self.bus.publish_terminal();

        let after_close = self.after_close.lock().await.take();
        {
            // Marks the session closed even if the callback panics
            let _closed = MarkClosed(&self.lifecycle);
            if let Some(after_close) = after_close {
                after_close();
            }
        }

        tracing::info!(
            session_id = %self.id,
            messages = self.bus.published(),
            "Session closed"
        );
        Ok(())
    }
}

/// Instant `delay` after `from`, saturating far in the future on overflow.
fn deadline_after(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay).unwrap_or_else(|| from + FAR_FUTURE)
}

/// Moves the lifecycle from `Closing` to `Closed` when dropped.
struct MarkClosed<'a>(&'a watch::Sender<LifecycleState>);

impl Drop for MarkClosed<'_> {
    fn drop(&mut self) {
        self.0.send_if_modified(|state| {
            if state.can_transition_to(LifecycleState::Closed) {
                *state = LifecycleState::Closed;
                true
            } else {
                false
            }
        });
    }
}

/// Unwrap a session task's result, resuming its panic in the caller.
fn joined<T, E>(
    session_id: SessionId,
    result: Result<Result<T, SessionError<E>>, JoinError>,
) -> Result<T, SessionError<E>> {
    match result {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Session task cancelled");
            Err(SessionError::AlreadyClosed(session_id))
        }
    }
}
