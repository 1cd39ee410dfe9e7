//! Named counting semaphores.
//!
//! `lock` never blocks indefinitely: it waits at most a random duration drawn
//! from the configured [`BackoffRange`] and then reports failure. Callers must
//! be prepared to retry.
//!
//! Over-release hazard: more `unlock`s than successful `lock`s push the permit
//! count above its limit. This is not clamped; it is logged so that the
//! imbalance is visible.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::{Backing, HandleDescriptor, PrimitiveKind, Store, CANCEL_POLL};
use crate::ipc::client::BrokerClient;
use crate::types::BackoffRange;

#[derive(Debug)]
pub(crate) struct LocalSemaphore {
    permits: Mutex<usize>,
    limit: usize,
    available: Condvar,
}

impl LocalSemaphore {
    fn new(limit: usize) -> Self {
        Self {
            permits: Mutex::new(limit),
            limit,
            available: Condvar::new(),
        }
    }

    /// Take a permit, waiting at most `timeout` or until `cancel` fires.
    pub(crate) fn acquire_for(&self, timeout: Duration, cancel: Option<&CancellationToken>) -> bool {
        // an unrepresentable deadline waits without one
        let deadline = Instant::now().checked_add(timeout);
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                self.available.notify_one();
                return false;
            }
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return false;
            }
            let recheck = cancel.map(|_| now + CANCEL_POLL);
            match [deadline, recheck].into_iter().flatten().min() {
                Some(until) => {
                    self.available.wait_until(&mut permits, until);
                }
                None => self.available.wait(&mut permits),
            }
        }
        *permits -= 1;
        true
    }

    /// Return a permit. Returns the permit count afterwards.
    pub(crate) fn release(&self) -> usize {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.available.notify_one();
        *permits
    }

    fn available_permits(&self) -> usize {
        *self.permits.lock()
    }
}

/// Semaphore registry.
#[derive(Debug)]
pub struct Semaphores {
    store: Store<LocalSemaphore>,
    backoff: BackoffRange,
}

impl Semaphores {
    pub(crate) fn new(backoff: BackoffRange) -> Self {
        Self {
            store: Store::new(PrimitiveKind::Semaphore),
            backoff,
        }
    }

    pub fn register(&self, name: &str, limit: usize) {
        self.store.insert_local(name, || LocalSemaphore::new(limit));
    }

    /// Try to take a permit within a randomized bounded wait.
    pub fn lock(&self, name: &str) -> bool {
        self.lock_for(name, self.backoff.sample())
    }

    /// Try to take a permit, waiting at most `wait`.
    pub fn lock_for(&self, name: &str, wait: Duration) -> bool {
        self.lock_for_unless(name, wait, None)
    }

    pub(crate) fn lock_for_unless(
        &self,
        name: &str,
        wait: Duration,
        cancel: Option<&CancellationToken>,
    ) -> bool {
        match self.store.get(name) {
            Some(Backing::Local(sem)) => sem.acquire_for(wait, cancel),
            Some(Backing::Remote(client)) => client.semaphore_acquire(name, wait),
            None => false,
        }
    }

    /// Return a permit.
    pub fn unlock(&self, name: &str) -> bool {
        match self.store.get(name) {
            Some(Backing::Local(sem)) => {
                let permits = sem.release();
                if permits > sem.limit {
                    tracing::warn!(
                        "semaphore {} over-released: {} permits, limit {}",
                        name,
                        permits,
                        sem.limit
                    );
                }
                true
            }
            Some(Backing::Remote(client)) => client.semaphore_release(name),
            None => false,
        }
    }

    /// Currently free permits of a local semaphore; `None` for remote handles.
    pub fn available_permits(&self, name: &str) -> Option<usize> {
        match self.store.get(name)? {
            Backing::Local(sem) => Some(sem.available_permits()),
            Backing::Remote(_) => None,
        }
    }

    pub fn backoff(&self) -> BackoffRange {
        self.backoff
    }

    pub fn contains(&self, name: &str) -> bool {
        self.store.contains(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.store.names()
    }

    pub fn export(&self) -> Vec<(String, HandleDescriptor)> {
        self.store.export()
    }

    pub fn import(&self, pairs: &[(String, HandleDescriptor)], client: &Arc<BrokerClient>) {
        self.store.import(pairs, client);
    }
}
