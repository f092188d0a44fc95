//! In-Flight Request Deduplication
//!
//! Identical requests that overlap in time share one dispatch. Identity is a
//! fingerprint of the request content (prompt plus selection requirement),
//! so two callers asking the same thing at the same time trigger exactly one
//! backend invocation chain and both receive its outcome.
//!
//! The check-and-insert is a single `DashMap` entry operation, so two
//! identical requests can never both miss and both dispatch.
//!
//! The leader's work holds a [`CompletionGuard`] that removes the key when
//! the work finishes, panics or is dropped. The dispatcher runs that work as
//! a spawned task, so a cancelled caller neither aborts it nor leaves the
//! key behind. Later identical requests start a fresh dispatch.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use sha2::{Digest, Sha256};

use super::policy::SelectionRequirement;

/// Hex SHA-256 over the prompt, a NUL separator and the requirement's JSON
#[must_use]
pub fn fingerprint(prompt: &str, requirement: &SelectionRequirement) -> String {
    let requirement_bytes = serde_json::to_vec(requirement)
        .unwrap_or_else(|_| format!("{requirement:?}").into_bytes());

    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update([0u8]);
    hasher.update(&requirement_bytes);
    hex::encode(hasher.finalize())
}

/// A dispatch that any number of callers can await
pub type SharedOutcome<T> = Shared<BoxFuture<'static, T>>;

/// Whether a caller started the work or joined someone else's
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

/// Map of fingerprint to the shared outcome of the request carrying it
pub struct InFlight<T: Clone> {
    entries: DashMap<String, SharedOutcome<T>>,
}

impl<T> InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Join the request registered under `key`, or register `start()` as its
    /// leader
    ///
    /// `start` runs at most once per key while the key is present. The
    /// future it returns is responsible for calling [`InFlight::complete`],
    /// usually by holding a [`InFlight::completion_guard`].
    pub fn join_or_start<F>(&self, key: &str, start: F) -> (SharedOutcome<T>, Role)
    where
        F: FnOnce() -> BoxFuture<'static, T>,
    {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(existing) => (existing.get().clone(), Role::Follower),
            Entry::Vacant(slot) => {
                let outcome = start().shared();
                slot.insert(outcome.clone());
                (outcome, Role::Leader)
            }
        }
    }

    /// Forget a finished request
    pub fn complete(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Guard that calls [`InFlight::complete`] for `key` when dropped
    pub fn completion_guard<'a>(&'a self, key: &'a str) -> CompletionGuard<'a, T> {
        CompletionGuard { inflight: self, key }
    }

    /// Whether a request with this fingerprint is running
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of distinct requests in flight
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Removes its key from the in-flight map on drop
#[must_use = "the key is removed as soon as the guard is dropped"]
pub struct CompletionGuard<'a, T: Clone + Send + Sync + 'static> {
    inflight: &'a InFlight<T>,
    key: &'a str,
}

impl<T: Clone + Send + Sync + 'static> Drop for CompletionGuard<'_, T> {
    fn drop(&mut self) {
        self.inflight.complete(self.key);
    }
}

impl<T> Default for InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> std::fmt::Debug for InFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight")
            .field("len", &self.entries.len())
            .finish()
    }
}
