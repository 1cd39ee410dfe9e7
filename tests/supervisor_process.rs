//! Supervised-process scenarios.
//!
//! Each test re-executes this test binary as its worker program, filtered to
//! the same test (`<name> --exact`). In the copy, `Supervisor::start` sees the
//! worker environment, runs the unit and exits, so everything before `start`
//! must be identical on both sides and parent-only code is guarded by
//! `is_worker_process()`.

use jeeves_procvisor::{
    is_worker_process, GlobalConfig, NoopNotifier, Registry, ShutdownHandle, Supervisor,
    SupervisorConfig, Task, WorkerError,
};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const WATCH_LIMIT: Duration = Duration::from_secs(20);

fn supervisor(test_name: &str, tweak: impl FnOnce(&mut SupervisorConfig)) -> Supervisor {
    let mut cfg = SupervisorConfig::default();
    cfg.poll_interval = Duration::from_millis(50);
    cfg.worker.args = vec![test_name.to_string(), "--exact".to_string()];
    tweak(&mut cfg);
    Supervisor::new(cfg, GlobalConfig::default()).with_notifier(NoopNotifier)
}

/// Terminate once `done` holds (or at the watch limit). Yields whether `done`
/// was reached.
fn terminate_when(
    handle: ShutdownHandle,
    registry: Arc<Registry>,
    done: impl Fn(&Registry) -> bool + Send + 'static,
) -> JoinHandle<bool> {
    std::thread::spawn(move || {
        let deadline = Instant::now() + WATCH_LIMIT;
        let reached = loop {
            if done(&registry) {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            std::thread::sleep(Duration::from_millis(20));
        };
        handle.terminate();
        reached
    })
}

/// Safety net for scenarios that should end on their own.
fn terminate_after_limit(handle: ShutdownHandle) {
    std::thread::spawn(move || {
        std::thread::sleep(WATCH_LIMIT);
        handle.terminate();
    });
}

#[test]
fn test_crashing_unit_is_restarted() {
    let mut sup = supervisor("test_crashing_unit_is_restarted", |_| {});
    sup.registry().counters().register("runs", 0);
    sup.add(Task::process("flaky", |ctx| {
        ctx.registry().counters().increase("runs");
        Err(WorkerError::failed("connection reset"))
    }))
    .unwrap();

    let registry = Arc::clone(sup.registry());
    let watcher = (!is_worker_process()).then(|| {
        terminate_when(sup.handle(), Arc::clone(&registry), |r| {
            r.counters().get("runs").unwrap_or(0) >= 3
        })
    });

    let report = sup.start().unwrap();
    assert!(watcher.unwrap().join().unwrap(), "unit was not restarted");
    assert!(report.restarts >= 2);
    assert!(registry.counters().get("runs").unwrap() >= 3);
    assert!(report.log_transport_closed);
}

#[test]
fn test_once_unit_is_not_restarted() {
    let mut sup = supervisor("test_once_unit_is_not_restarted", |_| {});
    sup.registry().counters().register("runs", 0);
    sup.add(Task::once("seed", |ctx| {
        ctx.registry().counters().increase("runs");
        Ok(())
    }))
    .unwrap();

    let registry = Arc::clone(sup.registry());
    if !is_worker_process() {
        terminate_after_limit(sup.handle());
    }

    let started = Instant::now();
    let report = sup.start().unwrap();
    assert!(started.elapsed() < WATCH_LIMIT);
    assert_eq!(report.restarts, 0);
    assert_eq!(report.processes_joined + report.processes_killed, 0);
    assert_eq!(registry.counters().get("runs"), Some(1));
}

#[test]
fn test_async_process_unit_runs() {
    let mut sup = supervisor("test_async_process_unit_runs", |_| {});
    sup.registry().counters().register("runs", 0);
    sup.add(
        Task::process_async("fetcher", |ctx| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            ctx.registry().counters().increase("runs");
            Ok::<(), WorkerError>(())
        })
        .restart_on_exit(false),
    )
    .unwrap();

    let registry = Arc::clone(sup.registry());
    if !is_worker_process() {
        terminate_after_limit(sup.handle());
    }

    let started = Instant::now();
    let report = sup.start().unwrap();
    assert!(started.elapsed() < WATCH_LIMIT);
    assert_eq!(report.restarts, 0);
    assert_eq!(registry.counters().get("runs"), Some(1));
}

#[test]
fn test_crash_without_auto_restart_drops_unit() {
    let mut sup = supervisor("test_crash_without_auto_restart_drops_unit", |cfg| {
        cfg.auto_restart = false;
    });
    sup.registry().counters().register("runs", 0);
    sup.add(Task::process("flaky", |ctx| {
        ctx.registry().counters().increase("runs");
        panic!("parser state corrupted");
    }))
    .unwrap();

    let registry = Arc::clone(sup.registry());
    if !is_worker_process() {
        terminate_after_limit(sup.handle());
    }

    let started = Instant::now();
    let report = sup.start().unwrap();
    assert!(started.elapsed() < WATCH_LIMIT);
    assert_eq!(report.restarts, 0);
    assert_eq!(registry.counters().get("runs"), Some(1));
}

#[test]
fn test_graceful_exit_is_never_restarted() {
    let mut sup = supervisor("test_graceful_exit_is_never_restarted", |_| {});
    sup.registry().counters().register("runs", 0);
    sup.add(Task::process("quitter", |ctx| {
        ctx.registry().counters().increase("runs");
        Err(WorkerError::GracefulExit)
    }))
    .unwrap();

    let registry = Arc::clone(sup.registry());
    if !is_worker_process() {
        terminate_after_limit(sup.handle());
    }

    let started = Instant::now();
    let report = sup.start().unwrap();
    assert!(started.elapsed() < WATCH_LIMIT);
    assert_eq!(report.restarts, 0);
    assert_eq!(registry.counters().get("runs"), Some(1));
}

#[test]
fn test_terminate_joins_cooperative_worker() {
    let mut sup = supervisor("test_terminate_joins_cooperative_worker", |_| {});
    sup.registry().counters().register("started", 0);
    sup.add(Task::process("looper", |ctx| {
        ctx.registry().counters().increase("started");
        loop {
            ctx.checkpoint()?;
            std::thread::sleep(Duration::from_millis(10));
        }
    }))
    .unwrap();

    let registry = Arc::clone(sup.registry());
    let watcher = (!is_worker_process()).then(|| {
        terminate_when(sup.handle(), Arc::clone(&registry), |r| {
            r.counters().get("started").unwrap_or(0) >= 1
        })
    });

    let report = sup.start().unwrap();
    assert!(watcher.unwrap().join().unwrap(), "worker never started");
    assert_eq!(report.processes_joined, 1);
    assert_eq!(report.processes_killed, 0);
    assert_eq!(report.restarts, 0);
    assert!(report.log_transport_closed);
}

#[test]
fn test_worker_ignoring_stop_is_killed() {
    let mut sup = supervisor("test_worker_ignoring_stop_is_killed", |cfg| {
        cfg.join_timeout = Duration::from_millis(300);
    });
    sup.registry().counters().register("started", 0);
    sup.add(Task::process("stubborn", |ctx| {
        ctx.registry().counters().increase("started");
        loop {
            std::thread::sleep(Duration::from_millis(10));
        }
    }))
    .unwrap();

    let registry = Arc::clone(sup.registry());
    let watcher = (!is_worker_process()).then(|| {
        terminate_when(sup.handle(), Arc::clone(&registry), |r| {
            r.counters().get("started").unwrap_or(0) >= 1
        })
    });

    let started = Instant::now();
    let report = sup.start().unwrap();
    assert!(watcher.unwrap().join().unwrap(), "worker never started");
    assert_eq!(report.processes_killed, 1);
    assert_eq!(report.processes_joined, 0);
    assert!(started.elapsed() < WATCH_LIMIT);
}
