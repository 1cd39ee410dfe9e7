//! Request and response bodies exchanged with the broker.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::ipc::marshal::SpawnPayload;
use crate::logging::LogLevel;
use crate::sync::{ExecutionContext, PrimitiveKind};
use crate::types::{OwnerId, SpawnToken};

/// Operation requested by a worker. Every primitive operation names its target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    /// Fetch the staged spawn payload. One-shot per token.
    Attach { token: SpawnToken },
    CounterGet { name: String },
    CounterIncrease { name: String },
    /// Mutex (`owner: None`) or reentrant lock acquire.
    LockAcquire {
        kind: PrimitiveKind,
        name: String,
        owner: Option<OwnerId>,
    },
    LockRelease {
        kind: PrimitiveKind,
        name: String,
        owner: Option<OwnerId>,
    },
    SemaphoreAcquire { name: String, timeout_ms: u64 },
    SemaphoreRelease { name: String },
    QueuePush {
        name: String,
        item: Value,
        ctx: ExecutionContext,
    },
    QueuePop { name: String, block: bool },
    QueueLen { name: String },
    QueueIsFull { name: String },
    QueueClear { name: String },
}

impl Request {
    /// Short operation label for logs.
    pub fn op(&self) -> &'static str {
        match self {
            Request::Attach { .. } => "attach",
            Request::CounterGet { .. } => "counter_get",
            Request::CounterIncrease { .. } => "counter_increase",
            Request::LockAcquire { .. } => "lock_acquire",
            Request::LockRelease { .. } => "lock_release",
            Request::SemaphoreAcquire { .. } => "semaphore_acquire",
            Request::SemaphoreRelease { .. } => "semaphore_release",
            Request::QueuePush { .. } => "queue_push",
            Request::QueuePop { .. } => "queue_pop",
            Request::QueueLen { .. } => "queue_len",
            Request::QueueIsFull { .. } => "queue_is_full",
            Request::QueueClear { .. } => "queue_clear",
        }
    }
}

/// Successful broker reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Attached(SpawnPayload),
    Count(Option<i64>),
    Flag(bool),
    Item(Option<(Value, ExecutionContext)>),
    Len(Option<usize>),
    IsFull(Option<bool>),
}

/// Body of a `MSG_ERROR` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

/// Where a worker's log records go: the broker socket of the owning process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogChannelDescriptor {
    pub socket: PathBuf,
    /// Bound of the worker-side record buffer.
    pub capacity: usize,
    /// Lowest level any parent writer accepts; workers filter below it.
    pub level: LogLevel,
}
