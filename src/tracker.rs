//! # Request Tracker
//!
//! Generic id-to-future correlation store. `track(id)` hands back a receiver
//! that completes exactly once, when `resolve` or `reject` is called with the
//! matching id. Completing an id twice is a no-op: the entry is removed on
//! first completion, never re-delivered.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::sync::MutexExt;

pub struct RequestTracker<T> {
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<T>>>>,
}

impl<T> RequestTracker<T> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register an id and return the completion handle. A duplicate id
    /// replaces the previous entry, whose receiver then resolves with
    /// `Closed` via sender drop.
    pub fn track(&self, id: u64) -> oneshot::Receiver<Result<T>> {
        let (tx, rx) = oneshot::channel();
        self.pending.guard().insert(id, tx);
        rx
    }

    /// Complete `id` with a value. Returns false if the id was unknown or
    /// already completed.
    pub fn resolve(&self, id: u64, value: T) -> bool {
        match self.pending.guard().remove(&id) {
            Some(tx) => tx.send(Ok(value)).is_ok(),
            None => false,
        }
    }

    /// Complete `id` with an error. Returns false if the id was unknown or
    /// already completed.
    pub fn reject(&self, id: u64, error: Error) -> bool {
        match self.pending.guard().remove(&id) {
            Some(tx) => tx.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Drop a pending entry without completing it. Used when the caller
    /// stopped waiting (request timeout) and the entry must not linger.
    pub fn forget(&self, id: u64) {
        self.pending.guard().remove(&id);
    }

    /// Reject every pending entry. Used on channel close.
    pub fn drain(&self, error: impl Fn() -> Error) {
        let drained: Vec<_> = {
            let mut pending = self.pending.guard();
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(error()));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for RequestTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}
