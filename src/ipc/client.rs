//! Worker-side broker client.
//!
//! Blocking: unit functions are plain threads, and a blocked
//! `lock`/`pop` must hold only its own connection. Idle connections are kept
//! in a small pool so concurrent threads of one worker never queue behind a
//! blocked call.

use parking_lot::Mutex;
use serde_json::Value;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ipc::codec::{
    decode, encode, read_frame_blocking, write_frame_blocking, MSG_ERROR, MSG_REQUEST,
    MSG_RESPONSE,
};
use crate::ipc::marshal::SpawnPayload;
use crate::ipc::protocol::{ErrorBody, Request, Response};
use crate::sync::{ExecutionContext, PrimitiveKind};
use crate::types::{Error, OwnerId, Result, SpawnToken};

const MAX_IDLE_CONNECTIONS: usize = 8;

/// Connection to the parent's broker.
#[derive(Debug)]
pub struct BrokerClient {
    path: PathBuf,
    max_frame_bytes: u32,
    idle: Mutex<Vec<UnixStream>>,
}

impl BrokerClient {
    /// Create a client for the broker at `path`. Connects lazily.
    pub fn new(path: impl AsRef<Path>, max_frame_bytes: u32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_frame_bytes,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    fn checkout(&self) -> Result<UnixStream> {
        if let Some(stream) = self.idle.lock().pop() {
            return Ok(stream);
        }
        Ok(UnixStream::connect(&self.path)?)
    }

    fn checkin(&self, stream: UnixStream) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(stream);
        }
    }

    /// One request/response exchange.
    pub fn call(&self, request: &Request) -> Result<Response> {
        let mut stream = self.checkout()?;
        let payload = encode(request)?;
        write_frame_blocking(&mut stream, MSG_REQUEST, &payload)?;

        let (msg_type, body) = read_frame_blocking(&mut stream, self.max_frame_bytes)?
            .ok_or_else(|| Error::channel_closed("broker closed the connection"))?;
        // connection is reusable once a full frame has been read
        self.checkin(stream);

        match msg_type {
            MSG_RESPONSE => decode(&body),
            MSG_ERROR => {
                let err: ErrorBody = decode(&body)?;
                Err(Error::protocol(err.message))
            }
            other => Err(Error::protocol(format!(
                "unexpected message type 0x{:02X}",
                other
            ))),
        }
    }

    /// Fetch the payload staged for this worker.
    pub fn attach(&self, token: &SpawnToken) -> Result<SpawnPayload> {
        match self.call(&Request::Attach {
            token: token.clone(),
        })? {
            Response::Attached(payload) => Ok(payload),
            other => Err(unexpected("attach", &other)),
        }
    }

    // Primitive operations. Failures are logged and degrade to None/false, the
    // same as an unknown name.

    pub(crate) fn counter_get(&self, name: &str) -> Option<i64> {
        self.count(Request::CounterGet {
            name: name.to_string(),
        })
    }

    pub(crate) fn counter_increase(&self, name: &str) -> Option<i64> {
        self.count(Request::CounterIncrease {
            name: name.to_string(),
        })
    }

    pub(crate) fn lock_acquire(
        &self,
        kind: PrimitiveKind,
        name: &str,
        owner: Option<&OwnerId>,
    ) -> bool {
        self.flag(Request::LockAcquire {
            kind,
            name: name.to_string(),
            owner: owner.cloned(),
        })
    }

    pub(crate) fn lock_release(
        &self,
        kind: PrimitiveKind,
        name: &str,
        owner: Option<&OwnerId>,
    ) -> bool {
        self.flag(Request::LockRelease {
            kind,
            name: name.to_string(),
            owner: owner.cloned(),
        })
    }

    pub(crate) fn semaphore_acquire(&self, name: &str, timeout: Duration) -> bool {
        self.flag(Request::SemaphoreAcquire {
            name: name.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })
    }

    pub(crate) fn semaphore_release(&self, name: &str) -> bool {
        self.flag(Request::SemaphoreRelease {
            name: name.to_string(),
        })
    }

    pub(crate) fn queue_push(&self, name: &str, item: Value, ctx: ExecutionContext) -> bool {
        self.flag(Request::QueuePush {
            name: name.to_string(),
            item,
            ctx,
        })
    }

    pub(crate) fn queue_pop(&self, name: &str, block: bool) -> Option<(Value, ExecutionContext)> {
        let request = Request::QueuePop {
            name: name.to_string(),
            block,
        };
        match self.call_logged(&request)? {
            Response::Item(item) => item,
            other => log_unexpected(request.op(), &other),
        }
    }

    pub(crate) fn queue_len(&self, name: &str) -> Option<usize> {
        let request = Request::QueueLen {
            name: name.to_string(),
        };
        match self.call_logged(&request)? {
            Response::Len(len) => len,
            other => log_unexpected(request.op(), &other),
        }
    }

    pub(crate) fn queue_is_full(&self, name: &str) -> Option<bool> {
        let request = Request::QueueIsFull {
            name: name.to_string(),
        };
        match self.call_logged(&request)? {
            Response::IsFull(full) => full,
            other => log_unexpected(request.op(), &other),
        }
    }

    pub(crate) fn queue_clear(&self, name: &str) -> bool {
        self.flag(Request::QueueClear {
            name: name.to_string(),
        })
    }

    fn call_logged(&self, request: &Request) -> Option<Response> {
        match self.call(request) {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::error!("broker_call_failed: op={}, error={}", request.op(), e);
                None
            }
        }
    }

    fn count(&self, request: Request) -> Option<i64> {
        match self.call_logged(&request)? {
            Response::Count(count) => count,
            other => log_unexpected(request.op(), &other),
        }
    }

    fn flag(&self, request: Request) -> bool {
        match self.call_logged(&request) {
            Some(Response::Flag(flag)) => flag,
            Some(other) => log_unexpected(request.op(), &other).unwrap_or(false),
            None => false,
        }
    }
}

fn unexpected(op: &str, response: &Response) -> Error {
    Error::protocol(format!("unexpected response to {}: {:?}", op, response))
}

fn log_unexpected<T>(op: &str, response: &Response) -> Option<T> {
    tracing::error!("{}", unexpected(op, response));
    None
}
