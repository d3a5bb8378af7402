//! Change notifications.
//!
//! Replicas report visible changes as [`Event`]s on channels returned by
//! `subscribe()`. Any number of receivers may be registered; each one gets
//! its own copy of every event, and receivers that have been dropped are
//! pruned on the next emission.
//!
//! Events are only built when at least one receiver exists, so an
//! unobserved replica never clones values for notifications.

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// A visible change to a replica.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<K, V> {
    /// A key became present or its value changed.
    Set {
        /// The key.
        key: K,
        /// The new winning value.
        value: V,
        /// The value it replaced, if the key was present.
        previous: Option<V>,
    },
    /// A key was removed.
    Delete {
        /// The key.
        key: K,
        /// The value that was removed.
        value: V,
    },
    /// An operation that is already the winning one was received again.
    Affirm {
        /// The key.
        key: K,
        /// The unchanged value.
        value: V,
    },
}

/// Fan-out list of channel senders.
#[derive(Debug)]
pub(crate) struct Subscribers<T> {
    senders: Vec<UnboundedSender<T>>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            senders: Vec::new(),
        }
    }
}

impl<T: Clone> Subscribers<T> {
    pub(crate) fn subscribe(&mut self) -> UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.push(tx);
        rx
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    pub(crate) fn emit(&mut self, item: T) {
        self.senders.retain(|tx| tx.send(item.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_receiver_gets_a_copy() {
        let mut subs = Subscribers::default();
        let mut a = subs.subscribe();
        let mut b = subs.subscribe();
        subs.emit(7);
        assert_eq!(a.try_recv().unwrap(), 7);
        assert_eq!(b.try_recv().unwrap(), 7);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let mut subs = Subscribers::default();
        let rx = subs.subscribe();
        drop(rx);
        assert!(!subs.is_empty());
        subs.emit(1);
        assert!(subs.is_empty());
    }
}
