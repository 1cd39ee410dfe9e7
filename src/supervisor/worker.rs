//! Running a unit: hooks, failure reporting and the worker-process bootstrap.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use super::recovery::with_recovery;
use super::signals::spawn_worker_watcher;
use super::task::{Hook, Task, WorkerContext};
use super::unit::GRACEFUL_EXIT_CODE;
use crate::ipc::client::BrokerClient;
use crate::ipc::marshal::decode;
use crate::logging::RemoteLogChannel;
use crate::notify::Notifier;
use crate::observability::init_tracing;
use crate::sync::Registry;
use crate::types::{Error, GlobalConfig, Result, SpawnToken, SupervisorConfig, WorkerError};

pub(crate) const ENV_TASK: &str = "PROCVISOR_WORKER_TASK";
pub(crate) const ENV_TOKEN: &str = "PROCVISOR_SPAWN_TOKEN";
pub(crate) const ENV_SOCKET: &str = "PROCVISOR_BROKER_SOCKET";

/// True in a process started by a supervisor to run one of its units.
pub fn is_worker_process() -> bool {
    std::env::var_os(ENV_TOKEN).is_some()
}

/// How a unit function ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Completed,
    GracefulExit,
    Failed,
}

impl UnitOutcome {
    /// Process exit code reported to the supervisor.
    pub fn exit_code(self) -> i32 {
        match self {
            UnitOutcome::Completed => 0,
            UnitOutcome::GracefulExit => GRACEFUL_EXIT_CODE,
            UnitOutcome::Failed => 1,
        }
    }
}

fn run_hook(hook: &Hook, ctx: &WorkerContext, which: &str) {
    let name = format!("{}.{}", ctx.task(), which);
    let result = with_recovery(
        || {
            hook(ctx);
            Ok(())
        },
        &name,
    );
    if let Err(e) = result {
        tracing::error!("hook {} failed: {}", name, e);
    }
}

/// Run `task` to completion: init hook, entry point, end hook.
///
/// A failure or panic is logged and reported through `notifier`; a graceful
/// exit is neither. The result never restarts anything by itself: restart is
/// decided by the supervisor when the process exits.
pub fn run_unit(task: &Task, ctx: &WorkerContext, notifier: &dyn Notifier) -> UnitOutcome {
    if let Some(init) = &task.init {
        run_hook(init, ctx, "init");
    }

    tracing::info!("unit {} ({}) started", task.name, task.kind);
    let outcome = match with_recovery(|| (task.entry)(ctx), &task.name) {
        Ok(()) => {
            tracing::info!("unit {} completed", task.name);
            UnitOutcome::Completed
        }
        Err(WorkerError::GracefulExit) => {
            tracing::info!("unit {} stopped gracefully", task.name);
            UnitOutcome::GracefulExit
        }
        Err(WorkerError::Failed(e)) => {
            tracing::error!("unit {} failed: {}", task.name, e);
            let title = if task.restart_on_exit {
                format!("{} down, will be restarted", task.name)
            } else {
                format!("{} down", task.name)
            };
            notifier.notify(&title, &e.to_string());
            UnitOutcome::Failed
        }
    };

    if let Some(end) = &task.end {
        run_hook(end, ctx, "end");
    }
    outcome
}

/// Identity a worker process receives from its parent.
#[derive(Debug, Clone)]
pub(crate) struct WorkerEnv {
    pub(crate) task: String,
    pub(crate) token: SpawnToken,
    pub(crate) socket: PathBuf,
}

impl WorkerEnv {
    /// `Ok(None)` outside a worker process.
    pub(crate) fn from_env() -> Result<Option<Self>> {
        let Some(token) = std::env::var_os(ENV_TOKEN) else {
            return Ok(None);
        };
        let token = SpawnToken::from_string(token.to_string_lossy().into_owned())
            .map_err(Error::config)?;
        let task = std::env::var(ENV_TASK)
            .map_err(|_| Error::config(format!("{} not set", ENV_TASK)))?;
        let socket = std::env::var_os(ENV_SOCKET)
            .map(PathBuf::from)
            .ok_or_else(|| Error::config(format!("{} not set", ENV_SOCKET)))?;
        Ok(Some(Self {
            task,
            token,
            socket,
        }))
    }
}

/// Worker-process main: attach to the parent, rebuild the context, run the
/// unit. Returns the process exit code.
pub(crate) fn run_worker(
    env: WorkerEnv,
    tasks: &[Task],
    cfg: &SupervisorConfig,
    notifier: &dyn Notifier,
) -> i32 {
    let client = Arc::new(BrokerClient::new(&env.socket, cfg.ipc.max_frame_bytes));
    let decoded = match client.attach(&env.token).and_then(decode) {
        Ok(decoded) => decoded,
        Err(e) => {
            eprintln!("worker {}: attach failed: {}", env.task, e);
            return UnitOutcome::Failed.exit_code();
        }
    };

    let log_channel = match RemoteLogChannel::connect(
        &decoded.log_channel.socket,
        decoded.log_channel.capacity,
        cfg.logging.poll_interval,
    ) {
        Ok(channel) => {
            init_tracing(channel.sender(), decoded.log_channel.level);
            Some(channel)
        }
        Err(e) => {
            eprintln!("worker {}: log channel unavailable: {}", env.task, e);
            None
        }
    };

    let outcome = match tasks.iter().find(|t| t.name == env.task) {
        Some(task) => {
            if decoded.init != task.init.is_some() || decoded.end != task.end.is_some() {
                tracing::warn!("unit {}: hooks differ between parent and worker", task.name);
            }
            let stop = Arc::new(AtomicBool::new(false));
            if let Err(e) = spawn_worker_watcher(Arc::clone(&stop)) {
                tracing::warn!("unit {}: signal watcher unavailable: {}", task.name, e);
            }
            let registry = Arc::new(Registry::attach(client, &decoded, cfg));
            let ctx = WorkerContext::new(
                task,
                decoded.args,
                decoded.kwargs,
                registry,
                GlobalConfig::new(decoded.global_config),
                stop,
            );
            run_unit(task, &ctx, notifier)
        }
        None => {
            tracing::error!("unit {} is not registered in this program", env.task);
            UnitOutcome::Failed
        }
    };

    if let Some(channel) = log_channel {
        channel.close();
    }
    outcome.exit_code()
}
