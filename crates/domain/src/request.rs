//! Requests accepted by a session and the items a rule produces from them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A request submitted to a session.
///
/// `CloseSession` is the distinguished sentinel that ends the session; any
/// holder of a session handle may submit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandRequest<P, C> {
    /// A player-issued command.
    Command { player: P, command: C },
    /// Gracefully close the session.
    CloseSession,
}

impl<P, C> CommandRequest<P, C> {
    pub fn command(player: P, command: C) -> Self {
        Self::Command { player, command }
    }

    pub fn close() -> Self {
        Self::CloseSession
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Self::CloseSession)
    }
}

/// A request resubmitted to the session once `delay` has passed.
///
/// Used for timers such as automatic round endings. When the inner request is
/// processed it may in turn produce further deferred requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredCommandRequest<P, C> {
    pub request: CommandRequest<P, C>,
    pub delay: Duration,
}

impl<P, C> DeferredCommandRequest<P, C> {
    pub fn new(request: CommandRequest<P, C>, delay: Duration) -> Self {
        Self { request, delay }
    }

    /// Close the session after `delay`.
    pub fn close_after(delay: Duration) -> Self {
        Self::new(CommandRequest::CloseSession, delay)
    }
}

/// One item returned by a rule for a processed command.
///
/// Messages are published in the order they appear; deferred requests are
/// handed to the session's scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing<P, C, M> {
    Message(M),
    Deferred(DeferredCommandRequest<P, C>),
}

impl<P, C, M> Outgoing<P, C, M> {
    pub fn message(message: M) -> Self {
        Self::Message(message)
    }

    pub fn deferred(player: P, command: C, delay: Duration) -> Self {
        Self::Deferred(DeferredCommandRequest::new(
            CommandRequest::command(player, command),
            delay,
        ))
    }

    pub fn close_after(delay: Duration) -> Self {
        Self::Deferred(DeferredCommandRequest::close_after(delay))
    }
}

impl<P, C, M> From<DeferredCommandRequest<P, C>> for Outgoing<P, C, M> {
    fn from(value: DeferredCommandRequest<P, C>) -> Self {
        Self::Deferred(value)
    }
}
