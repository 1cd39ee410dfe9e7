//! Task descriptions and the context a running unit sees.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::sync::Registry;
use crate::types::{GlobalConfig, WorkerError};

/// Unit entry point.
pub type UnitFn = Arc<dyn Fn(&WorkerContext) -> Result<(), WorkerError> + Send + Sync>;

/// Init/end hook run around the entry point.
pub type Hook = Arc<dyn Fn(&WorkerContext) + Send + Sync>;

/// How a unit is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    /// Separate OS process, restartable.
    Process,
    /// Thread in the supervisor process. Never restarted.
    Thread,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKind::Process => f.write_str("process"),
            UnitKind::Thread => f.write_str("thread"),
        }
    }
}

/// A named unit of work to supervise.
///
/// Tasks are registered under the same names in the parent and in every
/// worker (workers re-execute the same program), which is how a worker finds
/// its entry point and hooks.
#[derive(Clone)]
pub struct Task {
    pub(crate) name: String,
    pub(crate) kind: UnitKind,
    pub(crate) entry: UnitFn,
    pub(crate) args: Vec<Value>,
    pub(crate) kwargs: Map<String, Value>,
    pub(crate) init: Option<Hook>,
    pub(crate) end: Option<Hook>,
    pub(crate) restart_on_exit: bool,
}

impl Task {
    fn new<F>(name: impl Into<String>, kind: UnitKind, entry: F) -> Self
    where
        F: Fn(&WorkerContext) -> Result<(), WorkerError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind,
            entry: Arc::new(entry),
            args: Vec::new(),
            kwargs: Map::new(),
            init: None,
            end: None,
            restart_on_exit: kind == UnitKind::Process,
        }
    }

    /// A process unit, restarted whenever it exits.
    pub fn process<F>(name: impl Into<String>, entry: F) -> Self
    where
        F: Fn(&WorkerContext) -> Result<(), WorkerError> + Send + Sync + 'static,
    {
        Self::new(name, UnitKind::Process, entry)
    }

    /// A process unit that runs once and is not restarted.
    pub fn once<F>(name: impl Into<String>, entry: F) -> Self
    where
        F: Fn(&WorkerContext) -> Result<(), WorkerError> + Send + Sync + 'static,
    {
        Self::new(name, UnitKind::Process, entry).restart_on_exit(false)
    }

    /// A thread unit inside the supervisor process.
    pub fn thread<F>(name: impl Into<String>, entry: F) -> Self
    where
        F: Fn(&WorkerContext) -> Result<(), WorkerError> + Send + Sync + 'static,
    {
        Self::new(name, UnitKind::Thread, entry)
    }

    /// A process unit with an async entry point, restarted whenever it exits.
    pub fn process_async<F, Fut>(name: impl Into<String>, entry: F) -> Self
    where
        F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), WorkerError>> + 'static,
    {
        Self::new(name, UnitKind::Process, block_on_entry(entry))
    }

    /// A thread unit with an async entry point.
    pub fn thread_async<F, Fut>(name: impl Into<String>, entry: F) -> Self
    where
        F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), WorkerError>> + 'static,
    {
        Self::new(name, UnitKind::Thread, block_on_entry(entry))
    }

    pub fn arg(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    pub fn args(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(values);
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn on_init<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WorkerContext) + Send + Sync + 'static,
    {
        self.init = Some(Arc::new(hook));
        self
    }

    pub fn on_end<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WorkerContext) + Send + Sync + 'static,
    {
        self.end = Some(Arc::new(hook));
        self
    }

    /// Restart the process whenever it exits (ignored for thread units).
    pub fn restart_on_exit(mut self, restart: bool) -> Self {
        self.restart_on_exit = restart && self.kind == UnitKind::Process;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn restarts(&self) -> bool {
        self.restart_on_exit
    }
}

/// Drive an async entry point on a current-thread runtime built for each run.
/// Units never run inside the supervisor's own runtime, so blocking here is
/// safe.
fn block_on_entry<F, Fut>(
    entry: F,
) -> impl Fn(&WorkerContext) -> Result<(), WorkerError> + Send + Sync + 'static
where
    F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WorkerError>> + 'static,
{
    move |ctx| {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(WorkerError::failed)?;
        rt.block_on(entry(ctx.clone()))
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("args", &self.args)
            .field("kwargs", &self.kwargs)
            .field("init", &self.init.is_some())
            .field("end", &self.end.is_some())
            .field("restart_on_exit", &self.restart_on_exit)
            .finish_non_exhaustive()
    }
}

/// What a running unit gets handed.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    task: String,
    kind: UnitKind,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    registry: Arc<Registry>,
    global: GlobalConfig,
    stop: Arc<AtomicBool>,
}

impl WorkerContext {
    pub(crate) fn new(
        task: &Task,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        registry: Arc<Registry>,
        global: GlobalConfig,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            task: task.name.clone(),
            kind: task.kind,
            args,
            kwargs,
            registry,
            global,
            stop,
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn global(&self) -> &GlobalConfig {
        &self.global
    }

    /// Shutdown was requested for this unit.
    pub fn is_shutting_down(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// `Err(GracefulExit)` once shutdown was requested; use with `?` in
    /// long-running loops.
    pub fn checkpoint(&self) -> Result<(), WorkerError> {
        if self.is_shutting_down() {
            Err(WorkerError::GracefulExit)
        } else {
            Ok(())
        }
    }
}
