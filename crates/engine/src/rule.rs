//! The game-rule port.
//!
//! A session knows nothing about the game it runs. Everything game-specific
//! (which state a command touches, what happens when it is processed) lives
//! behind this trait.

use std::collections::BTreeSet;
use std::fmt::Debug;

use async_trait::async_trait;

use turnstile_domain::{Outgoing, ResourceId};

/// Outgoing items produced by a rule, typed by the rule's own vocabulary.
pub type RuleOutput<R> = Vec<Outgoing<<R as Rule>::Player, <R as Rule>::Command, <R as Rule>::Message>>;

/// Pluggable policy for one game type.
///
/// `process` runs while the session holds every lock `locks_for` returned for
/// the same command, so the rule may read and write that state freely. It must
/// be deterministic given consistent state and must not block indefinitely.
#[cfg_attr(test, mockall::automock(
    type Player = String;
    type Command = String;
    type Message = String;
    type Error = turnstile_domain::RuleError;
))]
#[async_trait]
pub trait Rule: Send + Sync + 'static {
    type Player: Debug + Send + Sync + 'static;
    type Command: Debug + Send + Sync + 'static;
    type Message: Clone + Debug + Send + Sync + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Resources `command` needs exclusive access to.
    fn locks_for(&self, command: &Self::Command) -> BTreeSet<ResourceId>;

    /// Process `command` from `player`.
    ///
    /// Messages are published in the returned order. Deferred requests are
    /// resubmitted to the session after their delay.
    async fn process(
        &self,
        player: Self::Player,
        command: Self::Command,
    ) -> Result<Vec<Outgoing<Self::Player, Self::Command, Self::Message>>, Self::Error>;
}
