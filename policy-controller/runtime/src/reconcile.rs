//! Drives the backend toward the state compiled by the index.
//!
//! A single scheduler loop receives reconcile keys, dispatches them to a bounded pool of workers,
//! and redrives failed keys from the [`RetryQueue`]. At most one attempt per key is in flight; a
//! key that changes while in flight is marked pending and dispatched again once the attempt ends.
//! Attempts for keys in the same namespace additionally share a lock, since a namespace's
//! default-deny groups are shared by all of its policies.

use crate::{
    index::{Desired, Key, SharedIndex},
    metrics::{EngineMetrics, Outcome},
    retry::{Backoff, RetryEntry, RetryQueue},
};
use parking_lot::Mutex;
use sdn_policy_controller_core::{Backend, BackendError};
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{mpsc, Notify, Semaphore},
    task::{self, JoinError, JoinSet},
    time::{self, Instant},
};
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub workers: usize,
    pub transact_timeout: Duration,
    pub backoff: Backoff,
    /// How often every eligible retry is redriven, in addition to its own deadline.
    pub retry_interval: Duration,
}

/// The reconciliation state of a key.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    Compiling,
    Transacting,
    Committed,
    Failed,
}

/// A handle to the reconciliation engine. Clones share state.
#[derive(Debug)]
pub struct Engine<B> {
    inner: Arc<Inner<B>>,
}

impl<B> Clone for Engine<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Debug)]
struct Inner<B> {
    index: SharedIndex,
    backend: B,
    config: EngineConfig,
    metrics: EngineMetrics,
    state: Mutex<State>,
    redrive: Notify,
    namespace_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

#[derive(Debug, Default)]
struct State {
    retries: RetryQueue,
    phases: HashMap<Key, Phase>,
    in_flight: HashSet<Key>,
    /// In-flight keys that changed after their attempt started.
    pending: HashSet<Key>,
    /// Keys whose desired state has been written to the backend at least once.
    committed: HashSet<Key>,
    /// Set by `request_retry` to redrive every queued entry.
    redrive_all: bool,
}

struct Attempt {
    key: Key,
    desired: Desired,
    result: Result<(), BackendError>,
}

/// The bounded pool running attempts. Each task's key is kept so that a task that panics can
/// still be recorded as a failed attempt.
struct Workers {
    semaphore: Arc<Semaphore>,
    attempts: JoinSet<Attempt>,
    keys: HashMap<task::Id, Key>,
}

enum Trigger {
    /// The key's inputs changed.
    Event,
    /// The key's retry became eligible.
    Retry,
}

// === impl EngineConfig ===

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            transact_timeout: Duration::from_secs(10),
            backoff: Backoff::default(),
            retry_interval: Duration::from_secs(60),
        }
    }
}

// === impl Engine ===

impl<B: Backend> Engine<B> {
    pub fn new(index: SharedIndex, backend: B, config: EngineConfig, metrics: EngineMetrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                index,
                backend,
                config,
                metrics,
                state: Mutex::new(State::default()),
                redrive: Notify::new(),
                namespace_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Records keys whose state already exists in the backend, so that their removal is written
    /// even if this process never committed them.
    pub fn mark_committed(&self, keys: impl IntoIterator<Item = Key>) {
        self.inner.state.lock().committed.extend(keys);
    }

    /// Runs the scheduler until the key stream ends.
    ///
    /// Every key known to the index is reconciled first.
    pub async fn run(self, mut keys: mpsc::UnboundedReceiver<Key>) {
        let mut workers = Workers::new(self.inner.config.workers);
        let mut redrive = time::interval(self.inner.config.retry_interval);
        redrive.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        redrive.reset();

        let initial = self.inner.index.read().keys();
        info!(keys = initial.len(), "Starting reconciliation");
        for key in initial {
            self.dispatch(key, Trigger::Event, &mut workers);
        }

        loop {
            let deadline = self.inner.state.lock().retries.next_deadline();
            let retry_ready = async move {
                match deadline {
                    Some(at) => time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                key = keys.recv() => match key {
                    Some(key) => self.dispatch(key, Trigger::Event, &mut workers),
                    None => break,
                },

                Some(res) = workers.join_next(), if !workers.is_empty() => {
                    let attempt = self.joined(res);
                    self.complete(attempt, &mut workers);
                }

                () = retry_ready => self.redrive(false, &mut workers),

                _ = redrive.tick() => self.redrive(false, &mut workers),

                () = self.inner.redrive.notified() => {
                    let all = std::mem::take(&mut self.inner.state.lock().redrive_all);
                    self.redrive(all, &mut workers);
                }
            }
        }

        debug!("Key stream closed; waiting for in-flight attempts");
        while let Some(res) = workers.join_next().await {
            let attempt = self.joined(res);
            self.record(attempt);
        }
    }

    /// The number of keys waiting to be retried.
    pub fn retry_depth(&self) -> usize {
        self.inner.state.lock().retries.len()
    }

    pub fn retry_entry(&self, key: &Key) -> Option<RetryEntry> {
        self.inner.state.lock().retries.get(key).cloned()
    }

    pub fn phase(&self, key: &Key) -> Phase {
        self.inner
            .state
            .lock()
            .phases
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    pub fn is_committed(&self, key: &Key) -> bool {
        self.inner.state.lock().committed.contains(key)
    }

    /// Redrives every queued retry now, regardless of backoff.
    pub fn request_retry(&self) {
        self.inner.state.lock().redrive_all = true;
        self.inner.redrive.notify_one();
    }

    /// Resets the backoff of `key`'s retry entry and redrives it now. Returns false if the key is
    /// not queued.
    pub fn retry_now(&self, key: &Key) -> bool {
        let reset = self.inner.state.lock().retries.reset(key, Instant::now());
        if reset {
            self.inner.redrive.notify_one();
        }
        reset
    }

    fn dispatch(&self, key: Key, trigger: Trigger, workers: &mut Workers) {
        let mut state = self.inner.state.lock();
        if state.in_flight.contains(&key) {
            debug!(%key, "Attempt in flight; marking pending");
            state.pending.insert(key);
            return;
        }

        if matches!(trigger, Trigger::Event) && state.retries.contains(&key) {
            let desired = self.inner.index.read().compile(&key);
            if desired.is_absent() && !state.committed.contains(&key) {
                debug!(%key, "Deleted before it was ever committed; dropping retry");
                state.retries.remove(&key);
                state.phases.remove(&key);
                self.inner.metrics.set_retry_depth(state.retries.len());
            } else {
                debug!(%key, "Superseding queued retry");
                state.retries.supersede(&key, desired);
            }
            return;
        }

        state.in_flight.insert(key.clone());
        state.phases.insert(key.clone(), Phase::Compiling);
        drop(state);

        let inner = self.inner.clone();
        let span = info_span!("reconcile", %key);
        let attempt = {
            let key = key.clone();
            async move { inner.attempt(key).await }.instrument(span)
        };
        workers.spawn(key, attempt);
    }

    /// Converts a task that did not return an attempt into a failed one, so that the key leaves
    /// the in-flight set and is retried.
    fn joined(&self, res: Result<Attempt, (Key, JoinError)>) -> Attempt {
        match res {
            Ok(attempt) => attempt,
            Err((key, error)) => {
                warn!(%key, %error, "Reconcile task failed");
                let desired = self.inner.index.read().compile(&key);
                Attempt {
                    key,
                    desired,
                    result: Err(BackendError::Fatal(format!("reconcile task failed: {error}"))),
                }
            }
        }
    }

    fn complete(&self, attempt: Attempt, workers: &mut Workers) {
        let key = attempt.key.clone();
        if self.record(attempt) {
            self.dispatch(key, Trigger::Event, workers);
        }
    }

    /// Records the outcome of an attempt. Returns true if the key changed while in flight.
    fn record(&self, Attempt { key, desired, result }: Attempt) -> bool {
        let kind = key.kind();
        let mut state = self.inner.state.lock();
        state.in_flight.remove(&key);
        let skipped = desired.is_absent() && !state.committed.contains(&key);

        match result {
            Ok(()) if skipped => {
                state.retries.remove(&key);
                state.phases.remove(&key);
                self.inner.metrics.reconciled(kind, Outcome::Skipped);
            }
            Ok(()) => {
                debug!(%key, "Committed");
                state.retries.remove(&key);
                if desired.is_absent() {
                    state.committed.remove(&key);
                    state.phases.remove(&key);
                } else {
                    state.committed.insert(key.clone());
                    state.phases.insert(key.clone(), Phase::Committed);
                }
                self.inner.metrics.reconciled(kind, Outcome::Committed);
            }
            Err(error) => {
                let transient = error.is_transient();
                let entry = state.retries.fail(
                    key.clone(),
                    desired,
                    &error,
                    &self.inner.config.backoff,
                    Instant::now(),
                );
                warn!(
                    %key,
                    %error,
                    transient,
                    failures = entry.failures,
                    "Transaction failed; will retry"
                );
                state.phases.insert(key.clone(), Phase::Failed);
                self.inner.metrics.reconciled(kind, Outcome::Failed);
                self.inner.metrics.transact_failed(transient);
            }
        }
        self.inner.metrics.set_retry_depth(state.retries.len());

        if let Some(ns) = key.namespace() {
            if !state.in_flight.iter().any(|k| k.namespace() == Some(ns)) {
                self.inner.release_namespace_lock(ns);
            }
        }

        state.pending.remove(&key)
    }

    fn redrive(&self, all: bool, workers: &mut Workers) {
        let keys = {
            let mut state = self.inner.state.lock();
            if all {
                state.retries.keys()
            } else {
                state.retries.pop_ready(Instant::now())
            }
        };
        if !keys.is_empty() {
            debug!(keys = keys.len(), "Redriving retries");
        }
        for key in keys {
            self.dispatch(key, Trigger::Retry, workers);
        }
    }
}

// === impl Workers ===

impl Workers {
    fn new(workers: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            attempts: JoinSet::new(),
            keys: HashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    fn spawn(&mut self, key: Key, attempt: impl Future<Output = Attempt> + Send + 'static) {
        let semaphore = self.semaphore.clone();
        let handle = self.attempts.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            attempt.await
        });
        self.keys.insert(handle.id(), key);
    }

    /// Waits for the next attempt to finish. A task that panicked or was cancelled is returned
    /// with the key it was reconciling.
    async fn join_next(&mut self) -> Option<Result<Attempt, (Key, JoinError)>> {
        loop {
            match self.attempts.join_next_with_id().await? {
                Ok((id, attempt)) => {
                    self.keys.remove(&id);
                    return Some(Ok(attempt));
                }
                Err(error) => match self.keys.remove(&error.id()) {
                    Some(key) => return Some(Err((key, error))),
                    None => warn!(%error, "Untracked reconcile task failed"),
                },
            }
        }
    }
}

// === impl Inner ===

impl<B: Backend> Inner<B> {
    async fn attempt(&self, key: Key) -> Attempt {
        let _guard = match key.namespace() {
            Some(ns) => Some(self.namespace_lock(ns).lock_owned().await),
            None => None,
        };

        let desired = self.index.read().compile(&key);
        let skip = desired.is_absent() && !self.state.lock().committed.contains(&key);
        if skip {
            return Attempt {
                key,
                desired,
                result: Ok(()),
            };
        }

        self.state.lock().phases.insert(key.clone(), Phase::Transacting);
        let ops = desired.clone().into_ops();
        debug!(ops = ops.len(), "Transacting");
        let timeout = self.config.transact_timeout;
        let result = match time::timeout(timeout, self.backend.transact(ops)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(timeout)),
        };
        Attempt {
            key,
            desired,
            result,
        }
    }

    fn namespace_lock(&self, ns: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.namespace_locks
            .lock()
            .entry(ns.to_string())
            .or_default()
            .clone()
    }

    fn release_namespace_lock(&self, ns: &str) {
        let mut locks = self.namespace_locks.lock();
        if locks.get(ns).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(ns);
        }
    }
}
