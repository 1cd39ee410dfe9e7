//! Task supervisor.
//!
//! The supervisor owns the task table, the parent [`Registry`], the logging
//! transport and the broker. Process units re-execute the current program;
//! the copy detects [`is_worker_process`] inside [`Supervisor::start`], runs
//! its one unit and exits.
//!
//! ```text
//!          signals ──► ControlEvent ──┐
//!   ShutdownHandle ──► ControlEvent ──┤
//!                                     ▼
//!   ┌──────────────────── control loop ─────────────────────┐
//!   │ poll tick / SIGCHLD → reap sweep → restart or drop    │
//!   │ SIGINT / SIGTERM    → shutdown flag, leave loop       │
//!   │   (graceful mode: drain children, 2nd signal leaves)  │
//!   └───────────────────────────────────────────────────────┘
//!                                     │
//!                                     ▼
//!   SIGTERM children → join or kill → broker down → queues closed
//!   → threads joined → logging transport closed → socket removed
//! ```

mod recovery;
mod signals;
mod task;
mod unit;
mod worker;

pub use recovery::with_recovery;
pub use signals::ControlEvent;
pub use task::{Hook, Task, UnitFn, UnitKind, WorkerContext};
pub use unit::{ExitKind, UnitState, GRACEFUL_EXIT_CODE};
pub use worker::{is_worker_process, run_unit, UnitOutcome};

use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::ipc::marshal::{self, check_reserved};
use crate::ipc::protocol::LogChannelDescriptor;
use crate::ipc::Broker;
use crate::logging::{build_writers, LogTransport, LogWriter};
use crate::notify::{Notifier, TracingNotifier};
use crate::observability::init_tracing;
use crate::sync::Registry;
use crate::types::{Error, GlobalConfig, Result, SignalMode, SpawnToken, SupervisorConfig};
use signals::forward_signals;
use unit::{ProcessUnit, ThreadUnit};
use worker::{run_worker, WorkerEnv, ENV_SOCKET, ENV_TASK, ENV_TOKEN};

/// Upper bound on the join poll while waiting for children to exit.
const JOIN_POLL: Duration = Duration::from_millis(20);

/// What shutdown did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Children that exited on their own after SIGTERM.
    pub processes_joined: usize,
    /// Children still alive at `join_timeout`, killed.
    pub processes_killed: usize,
    pub threads_joined: usize,
    /// Process restarts over the supervisor's lifetime.
    pub restarts: usize,
    pub log_transport_closed: bool,
}

/// Requests shutdown from outside the control loop (another thread, a test).
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: UnboundedSender<ControlEvent>,
    shutting_down: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Stop supervising: marks shutdown and leaves the poll loop at once, in
    /// either signal mode.
    pub fn terminate(&self) {
        self.shutting_down.store(true, Ordering::Release);
        if self.tx.send(ControlEvent::Shutdown).is_err() {
            tracing::debug!("shutdown requested after the supervisor stopped");
        }
    }
}

#[derive(Debug, Default)]
struct Units {
    processes: Vec<ProcessUnit>,
    threads: Vec<ThreadUnit>,
    report: ShutdownReport,
}

/// Per-run plumbing shared by spawn and restart.
#[derive(Debug)]
struct Plumbing {
    broker: Arc<Broker>,
    log_channel: LogChannelDescriptor,
}

/// Supervises a set of tasks until shutdown.
#[derive(Debug)]
pub struct Supervisor {
    cfg: SupervisorConfig,
    global: GlobalConfig,
    registry: Arc<Registry>,
    tasks: Vec<Task>,
    notifier: Arc<dyn Notifier>,
    writers: Vec<Box<dyn LogWriter>>,
    control_tx: UnboundedSender<ControlEvent>,
    control_rx: Option<UnboundedReceiver<ControlEvent>>,
    shutting_down: Arc<AtomicBool>,
    install_tracing: bool,
}

impl Supervisor {
    pub fn new(cfg: SupervisorConfig, global: GlobalConfig) -> Self {
        let (control_tx, control_rx) = unbounded_channel();
        Self {
            registry: Arc::new(Registry::new(&cfg)),
            cfg,
            global,
            tasks: Vec::new(),
            notifier: Arc::new(TracingNotifier),
            writers: Vec::new(),
            control_tx,
            control_rx: Some(control_rx),
            shutting_down: Arc::new(AtomicBool::new(false)),
            install_tracing: false,
        }
    }

    pub fn with_notifier(mut self, notifier: impl Notifier + 'static) -> Self {
        self.notifier = Arc::new(notifier);
        self
    }

    /// Extra writer next to the configured ones.
    pub fn with_writer(mut self, writer: impl LogWriter + 'static) -> Self {
        self.writers.push(Box::new(writer));
        self
    }

    /// Register a task. A duplicate name is ignored; a reserved keyword
    /// argument is a configuration error.
    pub fn add(&mut self, task: Task) -> Result<()> {
        check_reserved(&task.name, &task.kwargs)?;
        if self.tasks.iter().any(|t| t.name == task.name) {
            tracing::warn!("task {} already registered, ignoring", task.name);
            return Ok(());
        }
        self.tasks.push(task);
        Ok(())
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// The primitives every unit shares. Register names here before `start`.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.cfg
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.control_tx.clone(),
            shutting_down: Arc::clone(&self.shutting_down),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Blocking entry point.
    ///
    /// In a worker process this runs the worker's unit and exits the process
    /// with the unit's exit code; it never returns. Otherwise it installs
    /// tracing, builds a runtime and supervises until shutdown.
    pub fn start(mut self) -> Result<ShutdownReport> {
        match WorkerEnv::from_env() {
            Ok(Some(env)) => {
                let code = run_worker(env, &self.tasks, &self.cfg, self.notifier.as_ref());
                std::process::exit(code);
            }
            Ok(None) => {}
            Err(e) => {
                eprintln!("invalid worker environment: {}", e);
                std::process::exit(UnitOutcome::Failed.exit_code());
            }
        }

        self.install_tracing = true;
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        let report = rt.block_on(self.run());
        rt.shutdown_timeout(self.cfg.join_timeout);
        report
    }

    /// Supervise until shutdown. Can run once per supervisor.
    pub async fn run(&mut self) -> Result<ShutdownReport> {
        let mut control_rx = self
            .control_rx
            .take()
            .ok_or_else(|| Error::internal("supervisor already ran"))?;

        let transport = self.start_transport()?;
        if self.install_tracing {
            init_tracing(transport.sender(), transport.min_level());
        }

        let broker = Arc::new(Broker::new(
            Arc::clone(&self.registry),
            self.socket_path(),
            transport.sender(),
            self.cfg.ipc.max_frame_bytes,
        ));
        let listener = broker.bind()?;
        let serve = tokio::spawn(Arc::clone(&broker).serve(listener));
        let signal_tasks = match forward_signals(&self.control_tx) {
            Ok(tasks) => tasks,
            Err(e) => {
                broker.shutdown();
                broker.remove_socket();
                return Err(e);
            }
        };

        let plumbing = Plumbing {
            log_channel: LogChannelDescriptor {
                socket: broker.socket_path().to_path_buf(),
                capacity: self.cfg.logging.channel_capacity,
                level: transport.min_level(),
            },
            broker,
        };

        let mut units = Units::default();
        self.launch(&plumbing, &mut units);
        self.control_loop(&mut control_rx, &plumbing, &mut units).await;
        self.shutdown(&plumbing, &mut units).await;

        if let Err(e) = serve.await {
            tracing::warn!("broker task ended abnormally: {}", e);
        }
        for task in signal_tasks {
            task.abort();
        }

        tracing::info!(
            "supervisor_stopped: joined={}, killed={}, threads={}, restarts={}",
            units.report.processes_joined,
            units.report.processes_killed,
            units.report.threads_joined,
            units.report.restarts
        );
        transport.close();
        units.report.log_transport_closed = transport.is_closed();
        Ok(units.report)
    }

    fn start_transport(&mut self) -> Result<LogTransport> {
        let specs = self.global.writer_list();
        let mut writers = if specs.is_empty() && !self.writers.is_empty() {
            Vec::new()
        } else {
            build_writers(&specs, &self.global.running())
        };
        writers.append(&mut self.writers);
        LogTransport::start(writers, &self.cfg.logging)
    }

    fn socket_path(&self) -> PathBuf {
        let dir = self
            .cfg
            .ipc
            .socket_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let id = uuid::Uuid::new_v4().simple().to_string();
        dir.join(format!("procvisor-{}-{}.sock", std::process::id(), &id[..8]))
    }

    fn launch(&self, plumbing: &Plumbing, units: &mut Units) {
        for task in &self.tasks {
            match task.kind {
                UnitKind::Process => match self.spawn_process(plumbing, task) {
                    Ok((child, token)) => {
                        let unit = ProcessUnit::new(task.clone(), child, token);
                        tracing::info!("unit_started: name={}, kind=process, pid={}", task.name, unit.pid());
                        units.processes.push(unit);
                    }
                    Err(e) => tracing::error!("unit_spawn_failed: name={}, error={}", task.name, e),
                },
                UnitKind::Thread => match self.spawn_thread(task) {
                    Ok(unit) => {
                        tracing::info!("unit_started: name={}, kind=thread", task.name);
                        units.threads.push(unit);
                    }
                    Err(e) => tracing::error!("unit_spawn_failed: name={}, error={}", task.name, e),
                },
            }
        }
    }

    /// Stage the task's payload and start a worker for it.
    fn spawn_process(&self, plumbing: &Plumbing, task: &Task) -> Result<(Child, SpawnToken)> {
        let token = SpawnToken::new();
        let payload = marshal::encode(task, &self.registry, &plumbing.log_channel, &self.global)?;
        plumbing.broker.stage(token.clone(), payload);

        let program = match &self.cfg.worker.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        let spawned = Command::new(&program)
            .args(&self.cfg.worker.args)
            .env(ENV_TASK, &task.name)
            .env(ENV_TOKEN, token.as_str())
            .env(ENV_SOCKET, plumbing.broker.socket_path())
            .spawn();
        match spawned {
            Ok(child) => Ok((child, token)),
            Err(e) => {
                plumbing.broker.discard(&token);
                Err(Error::spawn(format!(
                    "{} ({}): {}",
                    task.name,
                    program.display(),
                    e
                )))
            }
        }
    }

    fn spawn_thread(&self, task: &Task) -> Result<ThreadUnit> {
        let ctx = WorkerContext::new(
            task,
            task.args.clone(),
            task.kwargs.clone(),
            Arc::clone(&self.registry),
            self.global.clone(),
            Arc::clone(&self.shutting_down),
        );
        let notifier = Arc::clone(&self.notifier);
        let owned = task.clone();
        let handle = std::thread::Builder::new()
            .name(format!("unit-{}", task.name))
            .spawn(move || {
                run_unit(&owned, &ctx, notifier.as_ref());
            })?;
        Ok(ThreadUnit {
            name: task.name.clone(),
            handle,
        })
    }

    async fn control_loop(
        &self,
        rx: &mut UnboundedReceiver<ControlEvent>,
        plumbing: &Plumbing,
        units: &mut Units,
    ) {
        let poll = self.cfg.poll_interval;

        // A graceful signal only stops restarts, so this keeps reaping until
        // the last child is gone.
        while !units.processes.is_empty() {
            tokio::select! {
                Some(event) = rx.recv() => {
                    if self.on_event(event) {
                        return;
                    }
                    self.reap(plumbing, units, event == ControlEvent::ChildExited);
                }
                _ = tokio::time::sleep(poll) => self.reap(plumbing, units, false),
            }
        }

        // No process left to watch; threads keep the supervisor alive.
        while !self.is_shutting_down() && units.threads.iter().any(|t| !t.is_finished()) {
            tokio::select! {
                Some(event) = rx.recv() => {
                    if self.on_event(event) {
                        return;
                    }
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Returns true when the loop must be left immediately.
    fn on_event(&self, event: ControlEvent) -> bool {
        match event {
            ControlEvent::ChildExited => false,
            ControlEvent::Interrupt | ControlEvent::Terminate => {
                let repeated = self.shutting_down.swap(true, Ordering::AcqRel);
                tracing::info!(
                    "shutdown_signal_received: event={:?}, mode={:?}, repeated={}",
                    event,
                    self.cfg.signal_mode,
                    repeated
                );
                match self.cfg.signal_mode {
                    SignalMode::Immediate => true,
                    SignalMode::Graceful if repeated => true,
                    SignalMode::Graceful => {
                        tracing::info!(
                            "graceful_shutdown: waiting for children to exit, signal again to stop now"
                        );
                        false
                    }
                }
            }
            ControlEvent::Shutdown => {
                tracing::info!("shutdown_requested");
                self.shutting_down.store(true, Ordering::Release);
                true
            }
        }
    }

    /// Non-blocking sweep over every tracked child.
    fn reap(&self, plumbing: &Plumbing, units: &mut Units, on_signal: bool) {
        let mut reaped = 0;
        let mut i = 0;
        while i < units.processes.len() {
            let status = match units.processes[i].child.try_wait() {
                Ok(Some(status)) => status,
                Ok(None) => {
                    i += 1;
                    continue;
                }
                Err(e) => {
                    let unit = &units.processes[i];
                    tracing::warn!("reap_failed: name={}, pid={}, error={}", unit.task.name, unit.pid(), e);
                    i += 1;
                    continue;
                }
            };
            reaped += 1;
            if self.on_exit(plumbing, &mut units.processes[i], status, &mut units.report) {
                i += 1;
            } else {
                units.processes.remove(i);
            }
        }
        if on_signal && reaped == 0 {
            tracing::debug!("no child process was immediately available");
        }
    }

    /// Handle one exited child. Returns true while the unit stays tracked.
    fn on_exit(
        &self,
        plumbing: &Plumbing,
        unit: &mut ProcessUnit,
        status: ExitStatus,
        report: &mut ShutdownReport,
    ) -> bool {
        // a child that died before attaching leaves its payload staged
        plumbing.broker.discard(&unit.token);
        let kind = ExitKind::classify(&status);
        let uptime = Utc::now() - unit.started_at;
        tracing::info!(
            "unit_exited: name={}, pid={}, status={}, kind={:?}, uptime_ms={}",
            unit.task.name,
            unit.pid(),
            status,
            kind,
            uptime.num_milliseconds()
        );
        advance(unit, kind.next_state());
        if kind == ExitKind::Graceful {
            return false;
        }

        let restart = unit.task.restart_on_exit && self.cfg.auto_restart && !self.is_shutting_down();
        if !restart {
            advance(unit, UnitState::Terminated);
            tracing::info!("unit_dropped: name={}", unit.task.name);
            return false;
        }

        advance(unit, UnitState::Restarting);
        match self.spawn_process(plumbing, &unit.task) {
            Ok((child, token)) => {
                unit.child = child;
                unit.token = token;
                unit.started_at = Utc::now();
                advance(unit, UnitState::Running);
                report.restarts += 1;
                tracing::info!("unit_restarted: name={}, pid={}", unit.task.name, unit.pid());
                true
            }
            Err(e) => {
                tracing::error!("unit_restart_failed: name={}, error={}", unit.task.name, e);
                advance(unit, UnitState::Terminated);
                false
            }
        }
    }

    async fn shutdown(&self, plumbing: &Plumbing, units: &mut Units) {
        self.shutting_down.store(true, Ordering::Release);
        tracing::info!(
            "supervisor_shutting_down: processes={}, threads={}",
            units.processes.len(),
            units.threads.len()
        );

        self.stop_processes(plumbing, units).await;
        plumbing.broker.shutdown();
        self.registry.close();

        for ThreadUnit { name, handle } in units.threads.drain(..) {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => tracing::error!("thread unit {} panicked outside its wrapper", name),
                Err(e) => tracing::error!("thread unit {} join failed: {}", name, e),
            }
            units.report.threads_joined += 1;
        }
        plumbing.broker.remove_socket();
    }

    /// SIGTERM every child, wait up to `join_timeout`, then SIGKILL the rest.
    async fn stop_processes(&self, plumbing: &Plumbing, units: &mut Units) {
        for unit in &units.processes {
            plumbing.broker.discard(&unit.token);
            match i32::try_from(unit.pid()) {
                Ok(pid) => {
                    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                        tracing::warn!("sigterm_failed: name={}, pid={}, error={}", unit.task.name, pid, e);
                    }
                }
                Err(_) => tracing::warn!("pid {} out of range, skipping SIGTERM", unit.pid()),
            }
        }

        let deadline = Instant::now() + self.cfg.join_timeout;
        let pause = JOIN_POLL.min(self.cfg.poll_interval);
        loop {
            let report = &mut units.report;
            units.processes.retain_mut(|unit| match unit.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!("unit_joined: name={}, status={}", unit.task.name, status);
                    advance(unit, UnitState::Terminated);
                    report.processes_joined += 1;
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    tracing::warn!("reap_failed: name={}, error={}", unit.task.name, e);
                    true
                }
            });
            if units.processes.is_empty() || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(pause).await;
        }

        for mut unit in units.processes.drain(..) {
            tracing::warn!(
                "unit_killed: name={}, pid={}, timeout={:?}",
                unit.task.name,
                unit.pid(),
                self.cfg.join_timeout
            );
            if let Err(e) = unit.child.kill() {
                tracing::warn!("kill_failed: name={}, error={}", unit.task.name, e);
            }
            if let Err(e) = unit.child.wait() {
                tracing::warn!("reap_failed: name={}, error={}", unit.task.name, e);
            }
            advance(&mut unit, UnitState::Terminated);
            units.report.processes_killed += 1;
        }
    }
}

fn advance(unit: &mut ProcessUnit, to: UnitState) {
    if unit.state == to {
        return;
    }
    if let Err(e) = unit.transition(to) {
        tracing::warn!("{}", e);
    }
}
