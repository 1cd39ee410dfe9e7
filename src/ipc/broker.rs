//! Parent-side broker: Unix socket accept loop and per-connection handler.
//!
//! Workers reach the parent's registry through here. Primitive operations may
//! block (lock acquire, blocking pop), so each runs on tokio's blocking pool
//! and holds only its own connection.
//!
//! A blocked operation whose worker hangs up is cancelled. If it had already
//! taken something (a queue item, the lock, a permit) that can no longer be
//! delivered, the broker gives it back.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::ipc::codec::{
    decode, encode, read_frame, write_frame, MSG_ERROR, MSG_LOG, MSG_REQUEST, MSG_RESPONSE,
};
use crate::ipc::marshal::SpawnPayload;
use crate::ipc::protocol::{ErrorBody, Request, Response};
use crate::logging::{LogRecord, LogSender};
use crate::sync::{PrimitiveKind, Registry};
use crate::types::{Error, Result, SpawnToken};

/// Broker wrapping the parent registry.
#[derive(Debug)]
pub struct Broker {
    registry: Arc<Registry>,
    socket_path: PathBuf,
    logs: LogSender,
    staged: Mutex<HashMap<SpawnToken, SpawnPayload>>,
    cancel: CancellationToken,
    max_frame_bytes: u32,
}

impl Broker {
    pub fn new(
        registry: Arc<Registry>,
        socket_path: impl Into<PathBuf>,
        logs: LogSender,
        max_frame_bytes: u32,
    ) -> Self {
        Self {
            registry,
            socket_path: socket_path.into(),
            logs,
            staged: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            max_frame_bytes,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket, replacing a stale socket file. Must be called inside a
    /// tokio runtime.
    pub fn bind(&self) -> std::io::Result<UnixListener> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        UnixListener::bind(&self.socket_path)
    }

    /// Make `payload` available to the worker that presents `token`.
    pub fn stage(&self, token: SpawnToken, payload: SpawnPayload) {
        self.staged.lock().insert(token, payload);
    }

    /// Drop a payload nobody attached to (the spawn failed).
    pub fn discard(&self, token: &SpawnToken) {
        self.staged.lock().remove(token);
    }

    /// Payloads still waiting for their worker.
    pub fn staged_count(&self) -> usize {
        self.staged.lock().len()
    }

    fn take_staged(&self, token: &SpawnToken) -> Option<SpawnPayload> {
        self.staged.lock().remove(token)
    }

    /// Run the accept loop until [`Broker::shutdown`].
    pub async fn serve(self: Arc<Self>, listener: UnixListener) {
        tracing::info!("broker listening on {}", self.socket_path.display());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("broker shutting down");
                    break;
                }
                accept = listener.accept() => {
                    let stream = match accept {
                        Ok((stream, _addr)) => stream,
                        Err(e) => {
                            tracing::warn!("broker accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            continue;
                        }
                    };
                    let broker = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = broker.handle_connection(stream).await {
                            tracing::debug!("broker connection error: {}", e);
                        }
                    });
                }
            }
        }
    }

    /// Stop accepting and close open connections.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Remove the socket file.
    pub fn remove_socket(&self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    "failed to remove broker socket {}: {}",
                    self.socket_path.display(),
                    e
                );
            }
        }
    }

    /// Read frames → dispatch → write responses.
    async fn handle_connection(self: Arc<Self>, stream: UnixStream) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = read_frame(&mut reader, self.max_frame_bytes) => frame?,
            };
            let Some((msg_type, payload)) = frame else {
                break; // clean EOF
            };

            match msg_type {
                MSG_LOG => match decode::<LogRecord>(&payload) {
                    Ok(record) => self.logs.send(record),
                    Err(e) => tracing::warn!("undecodable log frame dropped: {}", e),
                },
                MSG_REQUEST => {
                    let request: Request = match decode(&payload) {
                        Ok(request) => request,
                        Err(e) => {
                            write_error(&mut writer, e.to_string()).await?;
                            continue;
                        }
                    };
                    let op = request.op();

                    let abandoned = self.cancel.child_token();
                    let pending = self.handle_request(request.clone(), abandoned.clone());
                    tokio::pin!(pending);
                    let outcome = tokio::select! {
                        outcome = &mut pending => Some(outcome),
                        _ = peer_closed(&reader) => None,
                    };
                    let Some(outcome) = outcome else {
                        abandoned.cancel();
                        if let Ok(response) = pending.await {
                            self.revert(&request, response);
                        }
                        tracing::debug!("worker hung up during {}", op);
                        break;
                    };

                    match outcome {
                        Ok(response) => {
                            let body = encode(&response)?;
                            if let Err(e) = write_frame(&mut writer, MSG_RESPONSE, &body).await {
                                self.revert(&request, response);
                                return Err(e.into());
                            }
                        }
                        Err(e) => write_error(&mut writer, e.to_string()).await?,
                    }
                }
                other => {
                    write_error(&mut writer, format!("Unexpected message type: 0x{:02X}", other))
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_request(
        &self,
        request: Request,
        abandoned: CancellationToken,
    ) -> Result<Response> {
        if let Request::Attach { token } = &request {
            return self
                .take_staged(token)
                .map(Response::Attached)
                .ok_or_else(|| Error::not_found(format!("no payload staged for {}", token)));
        }

        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || dispatch(&registry, request, &abandoned))
            .await
            .map_err(|e| Error::internal(format!("broker dispatch task failed: {}", e)))?
    }

    /// Give back what `request` took when `response` never reached its worker.
    fn revert(&self, request: &Request, response: Response) {
        let registry = &self.registry;
        let name = match (request, response) {
            (Request::QueuePop { name, .. }, Response::Item(Some((item, ctx)))) => {
                if !registry.queues().requeue(name, item, ctx) {
                    tracing::warn!("queue {} closed, undelivered item dropped", name);
                    return;
                }
                name
            }
            (
                Request::LockAcquire {
                    kind: PrimitiveKind::Lock,
                    name,
                    ..
                },
                Response::Flag(true),
            ) => {
                registry.locks().release(name);
                name
            }
            (
                Request::LockAcquire {
                    kind: PrimitiveKind::RLock,
                    name,
                    owner: Some(owner),
                },
                Response::Flag(true),
            ) => {
                registry.rlocks().release(name, owner);
                name
            }
            (Request::SemaphoreAcquire { name, .. }, Response::Flag(true)) => {
                registry.semaphores().unlock(name);
                name
            }
            _ => return,
        };
        tracing::warn!("reverted {} on {}: worker went away", request.op(), name);
    }
}

/// Resolve once the worker side of a pending request goes away. The worker
/// sends nothing while it waits for a reply, so any readable data means the
/// connection is no longer usable.
async fn peer_closed(reader: &OwnedReadHalf) {
    let mut scratch = [0u8; 1];
    loop {
        if reader.readable().await.is_err() {
            return;
        }
        match reader.try_read(&mut scratch) {
            Ok(0) => return,
            Ok(_) => {
                tracing::warn!("worker wrote during a pending request, dropping connection");
                return;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(_) => return,
        }
    }
}

async fn write_error<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    message: String,
) -> Result<()> {
    let body = encode(&ErrorBody { message })?;
    write_frame(writer, MSG_ERROR, &body).await?;
    Ok(())
}

/// Run one primitive operation against the parent registry.
///
/// Blocking waits end early once `abandoned` is cancelled.
pub(crate) fn dispatch(
    registry: &Registry,
    request: Request,
    abandoned: &CancellationToken,
) -> Result<Response> {
    let cancel = Some(abandoned);
    let response = match request {
        Request::Attach { .. } => {
            return Err(Error::protocol("attach is handled by the broker"));
        }
        Request::CounterGet { name } => Response::Count(registry.counters().get(&name)),
        Request::CounterIncrease { name } => {
            Response::Count(registry.counters().increase(&name))
        }
        Request::LockAcquire { kind, name, owner } => match (kind, owner) {
            (PrimitiveKind::Lock, _) => {
                Response::Flag(registry.locks().acquire_unless(&name, cancel))
            }
            (PrimitiveKind::RLock, Some(owner)) => {
                Response::Flag(registry.rlocks().acquire_unless(&name, &owner, cancel))
            }
            (kind, owner) => return Err(bad_lock_request(kind, owner.is_some())),
        },
        Request::LockRelease { kind, name, owner } => match (kind, owner) {
            (PrimitiveKind::Lock, _) => Response::Flag(registry.locks().release(&name)),
            (PrimitiveKind::RLock, Some(owner)) => {
                Response::Flag(registry.rlocks().release(&name, &owner))
            }
            (kind, owner) => return Err(bad_lock_request(kind, owner.is_some())),
        },
        Request::SemaphoreAcquire { name, timeout_ms } => Response::Flag(
            registry
                .semaphores()
                .lock_for_unless(&name, Duration::from_millis(timeout_ms), cancel),
        ),
        Request::SemaphoreRelease { name } => Response::Flag(registry.semaphores().unlock(&name)),
        Request::QueuePush { name, item, ctx } => {
            Response::Flag(registry.queues().push_unless(&name, item, ctx, cancel))
        }
        Request::QueuePop { name, block } => {
            Response::Item(registry.queues().pop_unless(&name, block, cancel))
        }
        Request::QueueLen { name } => Response::Len(registry.queues().len(&name)),
        Request::QueueIsFull { name } => Response::IsFull(registry.queues().is_full(&name)),
        Request::QueueClear { name } => Response::Flag(registry.queues().clear(&name)),
    };
    Ok(response)
}

fn bad_lock_request(kind: PrimitiveKind, has_owner: bool) -> Error {
    Error::protocol(format!(
        "invalid lock request: kind={}, owner={}",
        kind,
        if has_owner { "set" } else { "missing" }
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OwnerId;
    use serde_json::json;

    fn idle() -> CancellationToken {
        CancellationToken::new()
    }

    fn registry() -> Registry {
        let registry = Registry::default();
        registry.counters().register("pages", 10);
        registry.locks().register("db");
        registry.rlocks().register("cache");
        registry.queues().register("jobs", Some(2));
        registry
    }

    #[test]
    fn test_dispatch_counter_and_queue() {
        let registry = registry();
        let r = dispatch(
            &registry,
            Request::CounterIncrease {
                name: "pages".to_string(),
            },
            &idle(),
        )
        .unwrap();
        assert_eq!(r, Response::Count(Some(11)));

        let ctx = crate::sync::ExecutionContext::new(Duration::from_secs(5));
        let r = dispatch(
            &registry,
            Request::QueuePush {
                name: "jobs".to_string(),
                item: json!("a"),
                ctx,
            },
            &idle(),
        )
        .unwrap();
        assert_eq!(r, Response::Flag(true));

        let r = dispatch(
            &registry,
            Request::QueuePop {
                name: "jobs".to_string(),
                block: false,
            },
            &idle(),
        )
        .unwrap();
        assert_eq!(r, Response::Item(Some((json!("a"), ctx))));
    }

    #[test]
    fn test_dispatch_unknown_names_degrade() {
        let registry = registry();
        let r = dispatch(
            &registry,
            Request::CounterGet {
                name: "ghost".to_string(),
            },
            &idle(),
        )
        .unwrap();
        assert_eq!(r, Response::Count(None));
        let r = dispatch(
            &registry,
            Request::QueueLen {
                name: "ghost".to_string(),
            },
            &idle(),
        )
        .unwrap();
        assert_eq!(r, Response::Len(None));
    }

    #[test]
    fn test_dispatch_rejects_ownerless_rlock() {
        let registry = registry();
        let err = dispatch(
            &registry,
            Request::LockAcquire {
                kind: PrimitiveKind::RLock,
                name: "cache".to_string(),
                owner: None,
            },
            &idle(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        let err = dispatch(
            &registry,
            Request::LockAcquire {
                kind: PrimitiveKind::Queue,
                name: "jobs".to_string(),
                owner: None,
            },
            &idle(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("kind=queue"));
    }

    #[test]
    fn test_semaphore_wait_that_runs_out_is_a_false_flag() {
        let registry = registry();
        registry.semaphores().register("api", 1);
        assert!(registry.semaphores().lock("api"));

        let r = dispatch(
            &registry,
            Request::SemaphoreAcquire {
                name: "api".to_string(),
                timeout_ms: 20,
            },
            &idle(),
        )
        .unwrap();
        assert_eq!(r, Response::Flag(false));
        assert_eq!(registry.semaphores().available_permits("api"), Some(0));
    }

    #[test]
    fn test_dispatch_rlock_owner_round_trip() {
        let registry = registry();
        let owner = OwnerId::from_string("99:worker".to_string()).unwrap();
        for _ in 0..2 {
            let r = dispatch(
                &registry,
                Request::LockAcquire {
                    kind: PrimitiveKind::RLock,
                    name: "cache".to_string(),
                    owner: Some(owner.clone()),
                },
                &idle(),
            )
            .unwrap();
            assert_eq!(r, Response::Flag(true));
        }
        for _ in 0..2 {
            let r = dispatch(
                &registry,
                Request::LockRelease {
                    kind: PrimitiveKind::RLock,
                    name: "cache".to_string(),
                    owner: Some(owner.clone()),
                },
                &idle(),
            )
            .unwrap();
            assert_eq!(r, Response::Flag(true));
        }
    }

    #[tokio::test]
    async fn test_attach_is_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            crate::logging::LogTransport::start(Vec::new(), &Default::default()).unwrap();
        let broker = Broker::new(
            Arc::new(registry()),
            dir.path().join("b.sock"),
            transport.sender(),
            1 << 20,
        );
        let token = SpawnToken::new();
        let payload = SpawnPayload {
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
        };
        broker.stage(token.clone(), payload.clone());

        let attach = Request::Attach {
            token: token.clone(),
        };
        assert_eq!(
            broker.handle_request(attach.clone(), idle()).await.unwrap(),
            Response::Attached(payload)
        );
        assert!(matches!(
            broker.handle_request(attach, idle()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_cancelled_dispatch_leaves_held_lock_alone() {
        let registry = registry();
        assert!(registry.locks().acquire("db"));
        let abandoned = CancellationToken::new();
        abandoned.cancel();

        let r = dispatch(
            &registry,
            Request::LockAcquire {
                kind: PrimitiveKind::Lock,
                name: "db".to_string(),
                owner: None,
            },
            &abandoned,
        )
        .unwrap();
        assert_eq!(r, Response::Flag(false));
        assert!(registry.locks().release("db"));
        assert!(!registry.locks().release("db"));
    }

    #[tokio::test]
    async fn test_revert_returns_what_was_taken() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            crate::logging::LogTransport::start(Vec::new(), &Default::default()).unwrap();
        let registry = Arc::new(registry());
        let broker = Broker::new(
            Arc::clone(&registry),
            dir.path().join("b.sock"),
            transport.sender(),
            1 << 20,
        );

        registry.queues().push("jobs", json!("work-1"));
        registry.queues().push("jobs", json!("work-2"));
        let pop = Request::QueuePop {
            name: "jobs".to_string(),
            block: true,
        };
        let taken = dispatch(&registry, pop.clone(), &idle()).unwrap();
        broker.revert(&pop, taken);
        assert_eq!(
            registry.queues().try_pop("jobs").map(|(v, _)| v),
            Some(json!("work-1"))
        );

        let acquire = Request::LockAcquire {
            kind: PrimitiveKind::Lock,
            name: "db".to_string(),
            owner: None,
        };
        let taken = dispatch(&registry, acquire.clone(), &idle()).unwrap();
        broker.revert(&acquire, taken);
        assert!(!registry.locks().release("db"));

        // nothing taken, nothing given back
        broker.revert(&acquire, Response::Flag(false));
        assert!(registry.locks().acquire("db"));
        assert!(registry.locks().release("db"));

        transport.close();
    }
}
