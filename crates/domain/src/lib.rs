//! Turnstile domain vocabulary.
//!
//! Types shared between the session runtime and the rules plugged into it.
//! Nothing here performs I/O or owns game state.

pub mod error;
pub mod ids;
pub mod lifecycle;
pub mod request;

pub use error::{RuleError, SessionError};
pub use ids::{ResourceId, SessionId};
pub use lifecycle::LifecycleState;
pub use request::{CommandRequest, DeferredCommandRequest, Outgoing};
