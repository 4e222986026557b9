use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a session. Transitions only go forward:
/// `Open -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Accepting commands.
    Open,
    /// Close in progress: deferred work cancelled, in-flight work draining.
    Closing,
    /// Terminal message published and the close callback has run.
    Closed,
}

impl LifecycleState {
    pub fn is_open(self) -> bool {
        self == Self::Open
    }

    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::Closing) | (Self::Closing, Self::Closed)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Open => write!(f, "open"),
            LifecycleState::Closing => write!(f, "closing"),
            LifecycleState::Closed => write!(f, "closed"),
        }
    }
}
