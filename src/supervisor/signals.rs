//! OS signal plumbing.
//!
//! Signals never run supervisor logic directly. In the parent they become
//! [`ControlEvent`]s on the control channel; in a worker they flip the stop
//! flag the unit polls through `WorkerContext::checkpoint`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::types::Result;

/// Input of the supervisor control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// SIGINT.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// SIGCHLD: some child changed state.
    ChildExited,
    /// Programmatic shutdown through a `ShutdownHandle`.
    Shutdown,
}

/// Forward SIGINT, SIGTERM and SIGCHLD onto `tx`. Must be called inside a
/// tokio runtime; abort the returned tasks to stop forwarding.
pub(crate) fn forward_signals(tx: &UnboundedSender<ControlEvent>) -> Result<Vec<JoinHandle<()>>> {
    let kinds = [
        (SignalKind::interrupt(), ControlEvent::Interrupt),
        (SignalKind::terminate(), ControlEvent::Terminate),
        (SignalKind::child(), ControlEvent::ChildExited),
    ];

    let mut tasks = Vec::with_capacity(kinds.len());
    for (kind, event) in kinds {
        let mut stream = signal(kind)?;
        let tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(event).is_err() {
                    break;
                }
            }
        }));
    }
    Ok(tasks)
}

/// Worker side: set `stop` on SIGINT/SIGTERM.
///
/// The handlers are registered before this returns, so a signal sent right
/// after the unit starts is never lost to the default disposition.
pub(crate) fn spawn_worker_watcher(stop: Arc<AtomicBool>) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let mut sigint = {
        let _guard = rt.enter();
        signal(SignalKind::interrupt())?
    };
    let mut sigterm = {
        let _guard = rt.enter();
        signal(SignalKind::terminate())?
    };

    std::thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn(move || {
            rt.block_on(async {
                tokio::select! {
                    _ = sigint.recv()  => {},
                    _ = sigterm.recv() => {},
                }
            });
            tracing::info!("shutdown signal received, stopping unit");
            stop.store(true, Ordering::Release);
        })?;
    Ok(())
}
