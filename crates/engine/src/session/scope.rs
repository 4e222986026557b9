//! Task-local record of which sessions the current task is working for.
//!
//! Every task a session spawns runs inside [`SessionScope::within`]. A close
//! request issued from such a task would wait for its own completion, so the
//! session checks [`SessionScope::contains`] and rejects it instead.
//!
//! Scopes nest: work for session B started from inside session A's work
//! carries both ids.

use std::future::Future;

use turnstile_domain::SessionId;

tokio::task_local! {
    static ACTIVE_SESSIONS: Vec<SessionId>;
}

pub struct SessionScope;

impl SessionScope {
    /// Wrap `work` so that it runs inside `session_id`'s scope.
    ///
    /// The enclosing chain is captured when this is called, not when the
    /// future is first polled, so it can be handed to `tokio::spawn`.
    pub fn within<F>(session_id: SessionId, work: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        let mut chain = Self::current();
        if !chain.contains(&session_id) {
            chain.push(session_id);
        }
        ACTIVE_SESSIONS.scope(chain, work)
    }

    /// Sessions the current task is working for, outermost first.
    pub fn current() -> Vec<SessionId> {
        ACTIVE_SESSIONS
            .try_with(|chain| chain.clone())
            .unwrap_or_default()
    }

    /// Whether the current task is part of `session_id`'s work.
    pub fn contains(session_id: SessionId) -> bool {
        ACTIVE_SESSIONS
            .try_with(|chain| chain.contains(&session_id))
            .unwrap_or(false)
    }
}
