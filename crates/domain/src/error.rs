//! Error types shared by sessions and the rules that drive them.

use thiserror::Error;

use crate::ids::SessionId;

/// Failure of a `SessionHandle::accept` call.
///
/// `Domain` wraps whatever the rule rejected the command with; the session
/// stays open. The other two variants are the only lifecycle-level failures.
#[derive(Debug, Error)]
pub enum SessionError<E> {
    /// The rule rejected the command.
    #[error("Command rejected: {0}")]
    Domain(#[source] E),

    /// Close requested from inside the session's own scheduled work.
    ///
    /// Never expected through the public API; its occurrence means a rule or
    /// caller is closing the session it is running in.
    #[error("Session {0} cannot be closed from within its own scheduled work")]
    SelfCloseViolation(SessionId),

    /// The session no longer accepts commands.
    #[error("Session {0} is already closed")]
    AlreadyClosed(SessionId),
}

impl<E> SessionError<E> {
    /// Check if this is a rule rejection.
    pub fn is_domain(&self) -> bool {
        matches!(self, Self::Domain(_))
    }

    /// Get the rule's error, if this is a rule rejection.
    pub fn domain(&self) -> Option<&E> {
        match self {
            Self::Domain(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_already_closed(&self) -> bool {
        matches!(self, Self::AlreadyClosed(_))
    }

    pub fn is_self_close_violation(&self) -> bool {
        matches!(self, Self::SelfCloseViolation(_))
    }
}

/// General-purpose rejection for rules that have no error type of their own.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
    /// The command is malformed or not allowed for this player.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The command arrived in the wrong stage of the game.
    #[error("Incorrect stage: current {current}, expected one of {expected:?}")]
    IncorrectStage {
        current: String,
        expected: Vec<String>,
    },

    /// Something the command refers to does not exist.
    #[error("{entity_type} not found: {id}")]
    NotFound {
        entity_type: &'static str,
        id: String,
    },
}

impl RuleError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn incorrect_stage<I, S>(current: impl Into<String>, expected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::IncorrectStage {
            current: current.into(),
            expected: expected.into_iter().map(Into::into).collect(),
        }
    }

    pub fn not_found(entity_type: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity_type,
            id: id.to_string(),
        }
    }
}
