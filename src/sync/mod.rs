//! Named synchronization primitives shared across supervised units.
//!
//! A [`Registry`] holds one typed store per primitive kind. The parent's
//! registry owns the real objects; a worker process builds its own registry
//! whose entries are remote handles routed through the parent's broker, so
//! every unit that received a name operates on the *same* object.
//!
//! ```text
//!   parent process                         worker process
//! ┌──────────────────────┐             ┌──────────────────────┐
//! │ Registry (Local)     │◄── broker ──│ Registry (Remote)    │
//! │  counters  locks ... │   socket    │  counters  locks ... │
//! └──────────────────────┘             └──────────────────────┘
//! ```
//!
//! Every store is first-registration-wins and never raises on an unknown
//! name: the call is logged and degrades to `None`/`false`.

mod cache;
mod context;
mod counter;
mod lock;
mod queue;
mod semaphore;

pub use cache::{KeyedCache, LazyCache};
pub use context::ExecutionContext;
pub use counter::Counters;
pub use lock::{LockGuard, Locks, RLockGuard, RLocks};
pub use queue::Queues;
pub use semaphore::Semaphores;

use parking_lot::{Condvar, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::ipc::client::BrokerClient;
use crate::ipc::marshal::Decoded;
use crate::types::SupervisorConfig;

/// The five primitive kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveKind {
    Counter,
    Lock,
    RLock,
    Semaphore,
    Queue,
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PrimitiveKind::Counter => "counter",
            PrimitiveKind::Lock => "lock",
            PrimitiveKind::RLock => "rlock",
            PrimitiveKind::Semaphore => "semaphore",
            PrimitiveKind::Queue => "queue",
        };
        f.write_str(s)
    }
}

/// Reference to a parent-owned primitive, as it travels to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleDescriptor {
    pub kind: PrimitiveKind,
    pub name: String,
}

/// Where a registry entry's state actually lives.
#[derive(Debug)]
pub(crate) enum Backing<L> {
    Local(Arc<L>),
    Remote(Arc<BrokerClient>),
}

impl<L> Clone for Backing<L> {
    fn clone(&self) -> Self {
        match self {
            Backing::Local(l) => Backing::Local(Arc::clone(l)),
            Backing::Remote(c) => Backing::Remote(Arc::clone(c)),
        }
    }
}

/// Name-keyed store shared by all primitive managers.
#[derive(Debug)]
pub(crate) struct Store<L> {
    kind: PrimitiveKind,
    entries: RwLock<HashMap<String, Backing<L>>>,
}

impl<L> Store<L> {
    pub(crate) fn new(kind: PrimitiveKind) -> Self {
        Self {
            kind,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a locally owned primitive. First registration wins.
    pub(crate) fn insert_local(&self, name: &str, make: impl FnOnce() -> L) -> bool {
        self.insert(name, || Backing::Local(Arc::new(make())))
    }

    fn insert(&self, name: &str, make: impl FnOnce() -> Backing<L>) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            tracing::warn!("{} {} already registered, ignoring", self.kind, name);
            return false;
        }
        entries.insert(name.to_string(), make());
        true
    }

    pub(crate) fn get(&self, name: &str) -> Option<Backing<L>> {
        let found = self.entries.read().get(name).cloned();
        if found.is_none() {
            tracing::debug!("{} {} not registered, ignoring", self.kind, name);
        }
        found
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Flat `(name, handle)` list for marshalling, sorted by name.
    pub(crate) fn export(&self) -> Vec<(String, HandleDescriptor)> {
        self.names()
            .into_iter()
            .map(|name| {
                let desc = HandleDescriptor {
                    kind: self.kind,
                    name: name.clone(),
                };
                (name, desc)
            })
            .collect()
    }

    /// Bind every received handle to the broker behind `client`.
    pub(crate) fn import(&self, pairs: &[(String, HandleDescriptor)], client: &Arc<BrokerClient>) {
        for (name, desc) in pairs {
            if desc.kind != self.kind {
                tracing::error!(
                    "import {} {}: handle has kind {}, skipping",
                    self.kind,
                    name,
                    desc.kind
                );
                continue;
            }
            self.insert(name, || Backing::Remote(Arc::clone(client)));
        }
    }

    /// Visit every locally owned primitive.
    pub(crate) fn for_each_local(&self, mut f: impl FnMut(&str, &L)) {
        for (name, backing) in self.entries.read().iter() {
            if let Backing::Local(local) = backing {
                f(name, local);
            }
        }
    }
}

/// How often a cancellable wait rechecks its token.
pub(crate) const CANCEL_POLL: Duration = Duration::from_millis(25);

/// Wait on `cond` while `blocked` holds. With a token, the wait gives up once
/// it is cancelled and returns `false`; the wakeup it may have absorbed is
/// passed on to the next waiter.
pub(crate) fn wait_while<T>(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    cancel: Option<&CancellationToken>,
    mut blocked: impl FnMut(&mut T) -> bool,
) -> bool {
    while blocked(&mut **guard) {
        match cancel {
            None => cond.wait(guard),
            Some(token) if token.is_cancelled() => {
                cond.notify_one();
                return false;
            }
            Some(_) => {
                cond.wait_for(guard, CANCEL_POLL);
            }
        }
    }
    true
}

/// Explicit registry context: one namespace of primitives per supervised group.
#[derive(Debug)]
pub struct Registry {
    counters: Counters,
    locks: Locks,
    rlocks: RLocks,
    semaphores: Semaphores,
    queues: Queues,
}

impl Registry {
    pub fn new(cfg: &SupervisorConfig) -> Self {
        Self {
            counters: Counters::new(),
            locks: Locks::new(),
            rlocks: RLocks::new(),
            semaphores: Semaphores::new(cfg.semaphore_backoff),
            queues: Queues::new(cfg.queue_capacity, cfg.queue_item_timeout),
        }
    }

    /// Build a worker-side registry from decoded handle segments.
    pub fn attach(client: Arc<BrokerClient>, decoded: &Decoded, cfg: &SupervisorConfig) -> Self {
        let registry = Self::new(cfg);
        registry.counters.import(&decoded.counters, &client);
        registry.locks.import(&decoded.locks, &client);
        registry.rlocks.import(&decoded.rlocks, &client);
        registry.semaphores.import(&decoded.semaphores, &client);
        registry.queues.import(&decoded.queues, &client);
        registry
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn locks(&self) -> &Locks {
        &self.locks
    }

    pub fn rlocks(&self) -> &RLocks {
        &self.rlocks
    }

    pub fn semaphores(&self) -> &Semaphores {
        &self.semaphores
    }

    pub fn queues(&self) -> &Queues {
        &self.queues
    }

    /// Close queue resources; blocked consumers wake up empty-handed.
    pub fn close(&self) {
        self.queues.close_all();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(&SupervisorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_first_registration_wins() {
        let store: Store<i64> = Store::new(PrimitiveKind::Counter);
        assert!(store.insert_local("jobs", || 1));
        assert!(!store.insert_local("jobs", || 2));

        match store.get("jobs") {
            Some(Backing::Local(v)) => assert_eq!(*v, 1),
            other => panic!("unexpected entry: {:?}", other),
        }
        assert!(logs_contain("counter jobs already registered"));
    }

    #[test]
    fn test_cancelled_wait_gives_up() {
        let state = Arc::new((parking_lot::Mutex::new(false), Condvar::new()));
        let token = CancellationToken::new();

        let abandoned = {
            let state = Arc::clone(&state);
            let token = token.clone();
            std::thread::spawn(move || {
                let mut ready = state.0.lock();
                wait_while(&state.1, &mut ready, Some(&token), |ready| !*ready)
            })
        };
        let live = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || {
                let mut ready = state.0.lock();
                wait_while(&state.1, &mut ready, None, |ready| !*ready)
            })
        };
        std::thread::sleep(Duration::from_millis(30));
        token.cancel();
        assert!(!abandoned.join().unwrap());

        *state.0.lock() = true;
        state.1.notify_one();
        assert!(live.join().unwrap());
    }

    #[test]
    fn test_swapped_backoff_config_keeps_semaphore_lock_safe() {
        let cfg: SupervisorConfig = serde_json::from_value(serde_json::json!({
            "semaphore_backoff": { "min": "30ms", "max": "10ms" },
        }))
        .unwrap();
        let registry = Registry::new(&cfg);
        registry.semaphores().register("api", 1);
        assert!(registry.semaphores().lock("api"));
        assert!(!registry.semaphores().lock("api"));
    }

    #[test]
    fn test_missing_name_returns_none() {
        let store: Store<i64> = Store::new(PrimitiveKind::Queue);
        assert!(store.get("nope").is_none());
        assert!(!store.contains("nope"));
    }

    #[test]
    fn test_export_is_sorted_and_tagged() {
        let store: Store<()> = Store::new(PrimitiveKind::Semaphore);
        store.insert_local("b", || ());
        store.insert_local("a", || ());
        let exported = store.export();
        assert_eq!(
            exported,
            vec![
                (
                    "a".to_string(),
                    HandleDescriptor {
                        kind: PrimitiveKind::Semaphore,
                        name: "a".to_string()
                    }
                ),
                (
                    "b".to_string(),
                    HandleDescriptor {
                        kind: PrimitiveKind::Semaphore,
                        name: "b".to_string()
                    }
                ),
            ]
        );
    }

    #[test]
    fn test_import_rejects_wrong_kind() {
        let client = Arc::new(BrokerClient::new("/nonexistent/broker.sock", 1024));
        let store: Store<()> = Store::new(PrimitiveKind::Lock);
        let pairs = vec![
            (
                "ok".to_string(),
                HandleDescriptor {
                    kind: PrimitiveKind::Lock,
                    name: "ok".to_string(),
                },
            ),
            (
                "bad".to_string(),
                HandleDescriptor {
                    kind: PrimitiveKind::Counter,
                    name: "bad".to_string(),
                },
            ),
        ];
        store.import(&pairs, &client);
        assert_eq!(store.names(), vec!["ok".to_string()]);
        assert!(matches!(store.get("ok"), Some(Backing::Remote(_))));
    }
}
