//! Replayable broadcast of a session's outgoing messages.
//!
//! The bus is an append-only log. Each subscriber walks the log with its own
//! cursor, so late subscribers see the full history before live messages and
//! a slow subscriber never holds up the publisher or anyone else.
//!
//! The log ends with a single terminal entry. Subscribers never see it as a
//! value: their stream simply ends there.

use futures_util::stream::{self, Stream};
use tokio::sync::watch;

/// One entry of the message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Envelope<M> {
    Regular(M),
    Terminal,
}

#[derive(Debug)]
struct MessageLog<M> {
    entries: Vec<Envelope<M>>,
    terminated: bool,
}

impl<M> Default for MessageLog<M> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            terminated: false,
        }
    }
}

/// Ordered broadcast log for one session.
pub struct MessageBus<M> {
    log: watch::Sender<MessageLog<M>>,
}

impl<M> Default for MessageBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> MessageBus<M> {
    pub fn new() -> Self {
        let (log, _) = watch::channel(MessageLog::default());
        Self { log }
    }

    /// Append a message. Returns `false` (and drops the message) if the
    /// terminal entry was already published.
    pub fn publish(&self, message: M) -> bool {
        self.log.send_if_modified(|log| {
            if log.terminated {
                tracing::warn!("Message published after terminal entry, dropping it");
                return false;
            }
            log.entries.push(Envelope::Regular(message));
            true
        })
    }

    /// Append the terminal entry, ending every subscription.
    ///
    /// Returns `false` if a terminal entry already exists.
    pub fn publish_terminal(&self) -> bool {
        self.log.send_if_modified(|log| {
            if log.terminated {
                tracing::warn!("Terminal entry already published, ignoring");
                return false;
            }
            log.entries.push(Envelope::Terminal);
            log.terminated = true;
            true
        })
    }

    pub fn is_terminated(&self) -> bool {
        self.log.borrow().terminated
    }

    /// Number of regular messages published so far.
    pub fn published(&self) -> usize {
        let log = self.log.borrow();
        log.entries.len() - usize::from(log.terminated)
    }

    #[cfg(test)]
    pub(crate) fn entries(&self) -> Vec<Envelope<M>>
    where
        M: Clone,
    {
        self.log.borrow().entries.clone()
    }
}

impl<M> MessageBus<M>
where
    M: Clone + Send + Sync + 'static,
{
    /// Snapshot of every regular message published so far.
    pub fn history(&self) -> Vec<M> {
        self.log
            .borrow()
            .entries
            .iter()
            .filter_map(|entry| match entry {
                Envelope::Regular(message) => Some(message.clone()),
                Envelope::Terminal => None,
            })
            .collect()
    }

    /// Subscribe from the beginning of history.
    ///
    /// Every call returns an independent stream. It yields the full history,
    /// then live messages in publish order, and ends at the terminal entry.
    pub fn subscribe(&self) -> impl Stream<Item = M> + Send + 'static {
        let receiver = self.log.subscribe();
        stream::unfold((receiver, 0usize), |(mut receiver, cursor)| async move {
            let next = {
                // Fails only if the bus was dropped, which also ends the stream
                let log = receiver
                    .wait_for(|log| log.entries.len() > cursor)
                    .await
                    .ok()?;
                log.entries[cursor].clone()
            };
            match next {
                Envelope::Regular(message) => Some((message, (receiver, cursor + 1))),
                Envelope::Terminal => None,
            }
        })
    }
}
