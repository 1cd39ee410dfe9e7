//! Named integer counters.

use parking_lot::Mutex;
use std::sync::Arc;

use super::{Backing, HandleDescriptor, PrimitiveKind, Store};
use crate::ipc::client::BrokerClient;

/// Integer value guarded by its own lock.
#[derive(Debug)]
pub(crate) struct LocalCounter {
    value: Mutex<i64>,
}

impl LocalCounter {
    fn new(initial: i64) -> Self {
        Self {
            value: Mutex::new(initial),
        }
    }

    fn get(&self) -> i64 {
        *self.value.lock()
    }

    /// `None` when the value is already `i64::MAX`; the value is left as is.
    fn increase(&self) -> Option<i64> {
        let mut value = self.value.lock();
        *value = value.checked_add(1)?;
        Some(*value)
    }
}

/// Counter registry. `increase` is the only mutator.
#[derive(Debug)]
pub struct Counters {
    store: Store<LocalCounter>,
}

impl Counters {
    pub(crate) fn new() -> Self {
        Self {
            store: Store::new(PrimitiveKind::Counter),
        }
    }

    pub fn register(&self, name: &str, initial: i64) {
        self.store.insert_local(name, || LocalCounter::new(initial));
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        match self.store.get(name)? {
            Backing::Local(counter) => Some(counter.get()),
            Backing::Remote(client) => client.counter_get(name),
        }
    }

    /// Increment by one and return the post-increment value.
    ///
    /// Increments on one name are linearizable, so the returned value tells
    /// the caller its position (the Nth caller sees N above the initial value).
    pub fn increase(&self, name: &str) -> Option<i64> {
        match self.store.get(name)? {
            Backing::Local(counter) => {
                let value = counter.increase();
                if value.is_none() {
                    tracing::error!("counter {} overflowed, increase ignored", name);
                }
                value
            }
            Backing::Remote(client) => client.counter_increase(name),
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use tracing_test::traced_test;

    #[test]
    fn test_register_keeps_first_initial_value() {
        let counters = Counters::new();
        counters.register("jobs", 5);
        counters.register("jobs", 100);
        assert_eq!(counters.get("jobs"), Some(5));
        assert_eq!(counters.increase("jobs"), Some(6));
    }

    #[test]
    fn test_unregistered_counter() {
        let counters = Counters::new();
        assert_eq!(counters.get("ghost"), None);
        assert_eq!(counters.increase("ghost"), None);
    }

    #[test]
    #[traced_test]
    fn test_increase_at_max_is_refused() {
        let counters = Counters::new();
        counters.register("edge", i64::MAX - 1);
        assert_eq!(counters.increase("edge"), Some(i64::MAX));
        assert_eq!(counters.increase("edge"), None);
        assert_eq!(counters.get("edge"), Some(i64::MAX));
        assert!(logs_contain("counter edge overflowed"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_concurrent_increase_loses_no_updates(threads in 1usize..8, per_thread in 1usize..200) {
            let counters = Arc::new(Counters::new());
            counters.register("hits", 0);

            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let counters = Arc::clone(&counters);
                    std::thread::spawn(move || {
                        (0..per_thread)
                            .map(|_| counters.increase("hits").unwrap())
                            .collect::<Vec<i64>>()
                    })
                })
                .collect();

            let mut seen = HashSet::new();
            for handle in handles {
                let observed = handle.join().unwrap();
                // each caller sees strictly increasing values
                prop_assert!(observed.windows(2).all(|w| w[0] < w[1]));
                for v in observed {
                    prop_assert!(seen.insert(v), "value {} observed twice", v);
                }
            }

            let total = (threads * per_thread) as i64;
            prop_assert_eq!(counters.get("hits"), Some(total));
            let expected: HashSet<i64> = (1..=total).collect();
            prop_assert_eq!(seen, expected);
        }
    }
}
