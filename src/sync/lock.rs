//! Named mutexes and reentrant locks with scoped acquire-then-release.
//!
//! Unlike `std::sync::Mutex`, acquisition is not tied to a guard's lifetime on
//! the wire: a remote holder acquires with one request and releases with
//! another. The scoped API ([`Locks::lock`], [`RLocks::lock`]) pairs the two
//! through a drop guard. Pairing of the raw `acquire`/`release` calls is the
//! caller's responsibility.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{wait_while, Backing, HandleDescriptor, PrimitiveKind, Store};
use crate::ipc::client::BrokerClient;
use crate::types::OwnerId;

#[derive(Debug, Default)]
pub(crate) struct LocalLock {
    locked: Mutex<bool>,
    released: Condvar,
}

impl LocalLock {
    fn acquire(&self, cancel: Option<&CancellationToken>) -> bool {
        let mut locked = self.locked.lock();
        if !wait_while(&self.released, &mut locked, cancel, |locked| *locked) {
            return false;
        }
        *locked = true;
        true
    }

    fn release(&self) -> bool {
        let mut locked = self.locked.lock();
        if !*locked {
            return false;
        }
        *locked = false;
        self.released.notify_one();
        true
    }
}

#[derive(Debug, Default)]
pub(crate) struct LocalRLock {
    holder: Mutex<Option<(OwnerId, u32)>>,
    released: Condvar,
}

impl LocalRLock {
    fn acquire(&self, owner: &OwnerId, cancel: Option<&CancellationToken>) -> bool {
        let mut holder = self.holder.lock();
        let free = wait_while(&self.released, &mut holder, cancel, |holder| {
            matches!(holder, Some((current, _)) if current != owner)
        });
        if !free {
            return false;
        }
        match holder.as_mut() {
            Some((_, depth)) => *depth += 1,
            None => *holder = Some((owner.clone(), 1)),
        }
        true
    }

    fn release(&self, owner: &OwnerId) -> bool {
        let mut holder = self.holder.lock();
        match holder.as_mut() {
            Some((current, depth)) if current == owner => {
                *depth -= 1;
                if *depth == 0 {
                    *holder = None;
                    self.released.notify_one();
                }
                true
            }
            _ => false,
        }
    }
}

/// Mutex registry.
#[derive(Debug)]
pub struct Locks {
    store: Store<LocalLock>,
}

impl Locks {
    pub(crate) fn new() -> Self {
        Self {
            store: Store::new(PrimitiveKind::Lock),
        }
    }

    pub fn register(&self, name: &str) {
        self.store.insert_local(name, LocalLock::default);
    }

    /// Block until the mutex is held. `false` when the name is unknown or the
    /// broker could not be reached.
    pub fn acquire(&self, name: &str) -> bool {
        self.acquire_unless(name, None)
    }

    /// [`Locks::acquire`] whose wait ends, unheld, when `cancel` fires.
    pub(crate) fn acquire_unless(&self, name: &str, cancel: Option<&CancellationToken>) -> bool {
        match self.store.get(name) {
            Some(Backing::Local(lock)) => lock.acquire(cancel),
            Some(Backing::Remote(client)) => {
                client.lock_acquire(PrimitiveKind::Lock, name, None)
            }
            None => false,
        }
    }

    /// Release a held mutex. Releasing an unlocked mutex is logged and ignored.
    pub fn release(&self, name: &str) -> bool {
        let released = match self.store.get(name) {
            Some(Backing::Local(lock)) => lock.release(),
            Some(Backing::Remote(client)) => {
                client.lock_release(PrimitiveKind::Lock, name, None)
            }
            None => return false,
        };
        if !released {
            tracing::warn!("lock {} released while not held", name);
        }
        released
    }

    /// Scoped acquire; the returned guard releases on drop.
    pub fn lock(&self, name: &str) -> Option<LockGuard<'_>> {
        self.acquire(name).then(|| LockGuard {
            locks: self,
            name: name.to_string(),
        })
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

/// Releases its mutex when dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    locks: &'a Locks,
    name: String,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.name);
    }
}

/// Reentrant lock registry. Ownership is per thread of a process.
#[derive(Debug)]
pub struct RLocks {
    store: Store<LocalRLock>,
}

impl RLocks {
    pub(crate) fn new() -> Self {
        Self {
            store: Store::new(PrimitiveKind::RLock),
        }
    }

    pub fn register(&self, name: &str) {
        self.store.insert_local(name, LocalRLock::default);
    }

    /// Block until `owner` holds the lock; re-acquiring deepens the hold.
    pub fn acquire(&self, name: &str, owner: &OwnerId) -> bool {
        self.acquire_unless(name, owner, None)
    }

    pub(crate) fn acquire_unless(
        &self,
        name: &str,
        owner: &OwnerId,
        cancel: Option<&CancellationToken>,
    ) -> bool {
        match self.store.get(name) {
            Some(Backing::Local(lock)) => lock.acquire(owner, cancel),
            Some(Backing::Remote(client)) => {
                client.lock_acquire(PrimitiveKind::RLock, name, Some(owner))
            }
            None => false,
        }
    }

    /// Undo one acquire by `owner`. Release by a non-holder is logged and ignored.
    pub fn release(&self, name: &str, owner: &OwnerId) -> bool {
        let released = match self.store.get(name) {
            Some(Backing::Local(lock)) => lock.release(owner),
            Some(Backing::Remote(client)) => {
                client.lock_release(PrimitiveKind::RLock, name, Some(owner))
            }
            None => return false,
        };
        if !released {
            tracing::warn!("rlock {} released by non-holder {}", name, owner);
        }
        released
    }

    /// Scoped acquire for the calling thread.
    pub fn lock(&self, name: &str) -> Option<RLockGuard<'_>> {
        let owner = OwnerId::current();
        self.acquire(name, &owner).then(|| RLockGuard {
            rlocks: self,
            name: name.to_string(),
            owner,
        })
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

/// Releases one level of its reentrant lock when dropped.
#[derive(Debug)]
pub struct RLockGuard<'a> {
    rlocks: &'a RLocks,
    name: String,
    owner: OwnerId,
}

impl Drop for RLockGuard<'_> {
    fn drop(&mut self) {
        self.rlocks.release(&self.name, &self.owner);
    }
}
