//! Named bounded FIFO work queues.
//!
//! Every item travels with an [`ExecutionContext`] whose deadline is fixed at
//! push time. Items are `serde_json::Value` so they can cross the broker.

use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{wait_while, Backing, ExecutionContext, HandleDescriptor, PrimitiveKind, Store};
use crate::ipc::client::BrokerClient;

#[derive(Debug)]
struct QueueState {
    items: VecDeque<(Value, ExecutionContext)>,
    closed: bool,
}

#[derive(Debug)]
pub(crate) struct LocalQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl LocalQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            capacity: capacity.max(1),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Append, blocking while the queue is full. `false` once closed or
    /// cancelled.
    pub(crate) fn push(
        &self,
        item: Value,
        ctx: ExecutionContext,
        cancel: Option<&CancellationToken>,
    ) -> bool {
        let capacity = self.capacity;
        let mut state = self.state.lock();
        if !wait_while(&self.not_full, &mut state, cancel, |s| {
            !s.closed && s.items.len() >= capacity
        }) || state.closed
        {
            return false;
        }
        state.items.push_back((item, ctx));
        self.not_empty.notify_one();
        true
    }

    /// Take the oldest item. With `block`, waits until one arrives, the
    /// queue is closed or the wait is cancelled.
    pub(crate) fn pop(
        &self,
        block: bool,
        cancel: Option<&CancellationToken>,
    ) -> Option<(Value, ExecutionContext)> {
        let mut state = self.state.lock();
        if block
            && !wait_while(&self.not_empty, &mut state, cancel, |s| {
                s.items.is_empty() && !s.closed
            })
        {
            return None;
        }
        let item = state.items.pop_front()?;
        self.not_full.notify_one();
        Some(item)
    }

    /// Put a popped item back at the head, ignoring capacity.
    fn requeue(&self, item: Value, ctx: ExecutionContext) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.items.push_front((item, ctx));
        self.not_empty.notify_one();
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        state.items.clear();
        self.not_full.notify_all();
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

/// Bounded queue registry.
#[derive(Debug)]
pub struct Queues {
    store: Store<LocalQueue>,
    default_capacity: usize,
    item_timeout: Duration,
}

impl Queues {
    pub(crate) fn new(default_capacity: usize, item_timeout: Duration) -> Self {
        Self {
            store: Store::new(PrimitiveKind::Queue),
            default_capacity,
            item_timeout,
        }
    }

    /// Register a queue; `None` uses the configured default capacity.
    pub fn register(&self, name: &str, capacity: Option<usize>) {
        let capacity = capacity.unwrap_or(self.default_capacity);
        self.store.insert_local(name, || LocalQueue::new(capacity));
    }

    /// Push with the default item timeout.
    pub fn push(&self, name: &str, item: Value) -> bool {
        self.push_with_timeout(name, item, self.item_timeout)
    }

    /// Push with a context whose deadline is `timeout` from now.
    pub fn push_with_timeout(&self, name: &str, item: Value, timeout: Duration) -> bool {
        self.push_context(name, item, ExecutionContext::new(timeout))
    }

    /// Push with an already built context. Used when relaying remote pushes so
    /// the deadline stays the one chosen by the producer.
    pub(crate) fn push_context(&self, name: &str, item: Value, ctx: ExecutionContext) -> bool {
        self.push_unless(name, item, ctx, None)
    }

    /// [`Queues::push_context`] whose wait for room ends when `cancel` fires.
    pub(crate) fn push_unless(
        &self,
        name: &str,
        item: Value,
        ctx: ExecutionContext,
        cancel: Option<&CancellationToken>,
    ) -> bool {
        match self.store.get(name) {
            Some(Backing::Local(queue)) => queue.push(item, ctx, cancel),
            Some(Backing::Remote(client)) => client.queue_push(name, item, ctx),
            None => false,
        }
    }

    pub fn pop(&self, name: &str, block: bool) -> Option<(Value, ExecutionContext)> {
        self.pop_unless(name, block, None)
    }

    /// [`Queues::pop`] whose blocking wait ends when `cancel` fires.
    pub(crate) fn pop_unless(
        &self,
        name: &str,
        block: bool,
        cancel: Option<&CancellationToken>,
    ) -> Option<(Value, ExecutionContext)> {
        match self.store.get(name)? {
            Backing::Local(queue) => queue.pop(block, cancel),
            Backing::Remote(client) => client.queue_pop(name, block),
        }
    }

    /// Return an item taken by a consumer that never received it. It becomes
    /// the next item popped. `false` when the queue is closed or not local.
    pub(crate) fn requeue(&self, name: &str, item: Value, ctx: ExecutionContext) -> bool {
        match self.store.get(name) {
            Some(Backing::Local(queue)) => queue.requeue(item, ctx),
            _ => false,
        }
    }

    pub fn try_pop(&self, name: &str) -> Option<(Value, ExecutionContext)> {
        self.pop(name, false)
    }

    pub fn len(&self, name: &str) -> Option<usize> {
        match self.store.get(name)? {
            Backing::Local(queue) => Some(queue.len()),
            Backing::Remote(client) => client.queue_len(name),
        }
    }

    pub fn is_empty(&self, name: &str) -> Option<bool> {
        self.len(name).map(|n| n == 0)
    }

    pub fn is_full(&self, name: &str) -> Option<bool> {
        match self.store.get(name)? {
            Backing::Local(queue) => Some(queue.is_full()),
            Backing::Remote(client) => client.queue_is_full(name),
        }
    }

    /// Drop every pending item.
    pub fn clear(&self, name: &str) -> bool {
        match self.store.get(name) {
            Some(Backing::Local(queue)) => {
                queue.clear();
                true
            }
            Some(Backing::Remote(client)) => client.queue_clear(name),
            None => false,
        }
    }

    /// Close every local queue. Blocked producers and consumers wake up and
    /// fail; later pushes are refused.
    pub fn close_all(&self) {
        self.store.for_each_local(|name, queue| {
            tracing::debug!("queue_closed: {}", name);
            queue.close();
        });
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
