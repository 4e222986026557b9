//! Turnstile Engine library.
//!
//! A generic session runtime for turn-based games. A [`Rule`] supplies the
//! game; a session supplies concurrency control, timers and broadcast.
//!
//! ## Structure
//!
//! - `session` - Session runtime: admission, lifecycle, deferred command flow
//! - `locks` - Named resource locks with ordered acquisition
//! - `scheduler` - Per-session task group and deferred command timers
//! - `message_bus` - Replayable, per-subscriber message log
//! - `rule` - The game-rule port
//! - `manager` - Registry of live sessions
//! - `settings` - Environment configuration

pub mod locks;
pub mod manager;
pub mod message_bus;
pub mod rule;
pub mod scheduler;
pub mod session;
pub mod settings;

pub use manager::{ManagerError, SessionManager};
pub use rule::{Rule, RuleOutput};
pub use session::{
    create_session, AcceptResult, AfterClose, SessionHandle, SessionRequest, SessionScope,
    SessionSummary,
};
pub use settings::EngineSettings;
