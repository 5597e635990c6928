//! Observable values.
//!
//! `Signal<T>` is a small observable built on `tokio::sync::watch`:
//! a current value plus change notification. Runtime state the client
//! exposes (socket status, cache gate, leadership) is published through
//! signals so binding layers can adapt them to framework-native state.

use std::sync::Arc;

use tokio::sync::watch;

/// A shared observable value. Cloning shares the underlying state.
#[derive(Debug)]
pub struct Signal<T> {
    tx: Arc<watch::Sender<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Signal<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Snapshot of the current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Publish a new value. Subscribers are only woken when the value
    /// actually changed.
    pub fn set(&self, value: T) {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }

    /// Receiver for awaiting changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Wait until the value satisfies `pred`, returning the matching value.
    /// Returns immediately when the current value already matches.
    pub async fn wait_for(&self, pred: impl FnMut(&T) -> bool) -> T {
        let mut rx = self.tx.subscribe();
        let result = match rx.wait_for(pred).await {
            Ok(value) => value.clone(),
            // The sender lives as long as `self`; closed only means the
            // signal was dropped mid-wait, so the snapshot is the best
            // remaining answer.
            Err(_) => self.get(),
        };
        result
    }
}
