//! Failed reconciliations, ordered by the time they next become eligible.

use crate::index::{Desired, Key};
use sdn_policy_controller_core::BackendError;
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    time::Duration,
};
use tokio::time::Instant;

/// Exponential backoff: the initial delay doubles with each consecutive failure, up to a cap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryEntry {
    pub key: Key,
    /// The desired state of the last failed attempt.
    pub old: Option<Desired>,
    /// A newer desired state observed while the entry was waiting. The next attempt recompiles
    /// from the index, so this is informational.
    pub new: Option<Desired>,
    /// Consecutive failures.
    pub failures: u32,
    pub next_retry: Instant,
    /// Set when the last failure was not transient. Terminal entries are still retried, at the
    /// maximum backoff.
    pub terminal: bool,
    pub last_error: Option<String>,
}

/// A delay queue of [`RetryEntry`]s keyed by [`Key`].
///
/// Deadlines live in a min-heap. Rescheduling an entry pushes a new deadline and leaves the old
/// one in place; stale deadlines are discarded when they reach the top of the heap.
#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: HashMap<Key, RetryEntry>,
    deadlines: BinaryHeap<Reverse<(Instant, Key)>>,
}

// === impl Backoff ===

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// The delay following the `failures`th consecutive failure.
    pub fn delay(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1 << shift)
            .map_or(self.max, |d| d.min(self.max))
    }
}

// === impl RetryQueue ===

impl RetryQueue {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &Key) -> Option<&RetryEntry> {
        self.entries.get(key)
    }

    /// Records a failed attempt to converge `key` to `desired` and schedules the next one.
    pub fn fail(
        &mut self,
        key: Key,
        desired: Desired,
        error: &BackendError,
        backoff: &Backoff,
        now: Instant,
    ) -> &RetryEntry {
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| RetryEntry {
                key: key.clone(),
                old: None,
                new: None,
                failures: 0,
                next_retry: now,
                terminal: false,
                last_error: None,
            });
        entry.failures = entry.failures.saturating_add(1);
        entry.terminal = !error.is_transient();
        entry.old = Some(desired);
        entry.new = None;
        entry.last_error = Some(error.to_string());
        let delay = if entry.terminal {
            backoff.max()
        } else {
            backoff.delay(entry.failures)
        };
        entry.next_retry = now + delay;
        self.deadlines.push(Reverse((entry.next_retry, key)));
        entry
    }

    /// Replaces the payload of a waiting entry with a newer desired state, without changing when
    /// it is retried. Returns false if there is no entry for `key`.
    pub fn supersede(&mut self, key: &Key, desired: Desired) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.new = Some(desired);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key: &Key) -> Option<RetryEntry> {
        self.entries.remove(key)
    }

    /// Makes the entry eligible immediately and forgets its failure count.
    pub fn reset(&mut self, key: &Key, now: Instant) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        entry.failures = 0;
        entry.next_retry = now;
        self.deadlines.push(Reverse((now, key.clone())));
        true
    }

    /// The earliest time at which an entry becomes eligible.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, key))) = self.deadlines.peek() {
            if self.is_current(key, *at) {
                return Some(*at);
            }
            self.deadlines.pop();
        }
        None
    }

    /// Removes and returns the keys of every entry eligible at `now`.
    ///
    /// The entries themselves stay in the queue until the retried attempt resolves them.
    pub fn pop_ready(&mut self, now: Instant) -> Vec<Key> {
        let mut ready = Vec::new();
        while let Some(Reverse((at, _))) = self.deadlines.peek() {
            if *at > now {
                break;
            }
            if let Some(Reverse((at, key))) = self.deadlines.pop() {
                if self.is_current(&key, at) && !ready.contains(&key) {
                    ready.push(key);
                }
            }
        }
        ready
    }

    /// Every queued key, regardless of its deadline.
    pub fn keys(&self) -> Vec<Key> {
        let mut keys = self.entries.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    fn is_current(&self, key: &Key, at: Instant) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.next_retry == at)
    }
}
