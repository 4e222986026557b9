//! Registry of live sessions.
//!
//! Sessions register on creation and unregister themselves when they close,
//! so the registry only ever lists sessions that can still be reached.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use thiserror::Error;

use turnstile_domain::{SessionError, SessionId};

use crate::rule::Rule;
use crate::session::{SessionHandle, SessionRequest, SessionSummary};
use crate::settings::EngineSettings;

#[derive(Debug, Error)]
pub enum ManagerError<E> {
    #[error("Session limit reached ({max} active sessions)")]
    CapacityReached { max: usize },

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error(transparent)]
    Session(#[from] SessionError<E>),
}

impl<E> ManagerError<E> {
    /// Get the rule's error, if a session rejected the command.
    pub fn domain(&self) -> Option<&E> {
        match self {
            Self::Session(err) => err.domain(),
            _ => None,
        }
    }
}

pub struct SessionManager<R: Rule> {
    sessions: Arc<DashMap<SessionId, SessionHandle<R>>>,
    active: Arc<AtomicUsize>,
    max_active_sessions: usize,
}

impl<R: Rule> SessionManager<R> {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            active: Arc::new(AtomicUsize::new(0)),
            max_active_sessions: settings.max_active_sessions,
        }
    }

    pub fn create_session(&self, rule: Arc<R>) -> Result<SessionHandle<R>, ManagerError<R::Error>> {
        self.create_session_with(rule, || {})
    }

    /// Create and register a session. `after_close` runs once the session has
    /// closed and left the registry.
    pub fn create_session_with<F>(
        &self,
        rule: Arc<R>,
        after_close: F,
    ) -> Result<SessionHandle<R>, ManagerError<R::Error>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.reserve_slot()?;

        let id = SessionId::new();
        let sessions: Weak<DashMap<SessionId, SessionHandle<R>>> = Arc::downgrade(&self.sessions);
        let active = Arc::clone(&self.active);
        let unregister = move || {
            if let Some(sessions) = sessions.upgrade() {
                sessions.remove(&id);
            }
            active.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(session_id = %id, "Session unregistered");
            after_close();
        };

        let session = SessionHandle::new(id, rule, Box::new(unregister));
        self.sessions.insert(id, session.clone());
        tracing::debug!(session_id = %id, active = self.len(), "Session registered");
        Ok(session)
    }

    fn reserve_slot(&self) -> Result<(), ManagerError<R::Error>> {
        let max = self.max_active_sessions;
        if max == 0 {
            self.active.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| {
                tracing::warn!(max, "Session limit reached, refusing new session");
                ManagerError::CapacityReached { max }
            })
    }

    pub fn get(&self, id: SessionId) -> Option<SessionHandle<R>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn active_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| entry.value().summary())
            .collect();
        summaries.sort_by_key(|summary| summary.created_at);
        summaries
    }

    /// Route `request` to session `id`.
    pub async fn accept(
        &self,
        id: SessionId,
        request: SessionRequest<R>,
    ) -> Result<(), ManagerError<R::Error>> {
        let session = self.get(id).ok_or(ManagerError::SessionNotFound(id))?;
        session.accept(request).await?;
        Ok(())
    }

    /// Close every registered session concurrently.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if sessions.is_empty() {
            return;
        }

        tracing::info!(count = sessions.len(), "Closing all sessions");
        let results =
            futures_util::future::join_all(sessions.iter().map(|session| session.close())).await;
        for (session, result) in sessions.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(session_id = %session.id(), error = %e, "Failed to close session");
            }
        }
    }
}
