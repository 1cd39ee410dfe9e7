//! Real SIGINT/SIGTERM delivered to the supervising process.
//!
//! The signals go to this whole test process, so every scenario holds
//! `SERIAL` for its full run and only one supervisor listens at a time. As in
//! `supervisor_process.rs`, each test re-executes this binary as its worker,
//! filtered to itself, and guards parent-only code with `is_worker_process()`.
//!
//! The poll interval is far longer than any scenario, so child exits are only
//! noticed through SIGCHLD.

use jeeves_procvisor::{
    is_worker_process, GlobalConfig, NoopNotifier, Registry, SignalMode, Supervisor,
    SupervisorConfig, Task,
};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

static SERIAL: Mutex<()> = parking_lot::const_mutex(());

const WATCH_LIMIT: Duration = Duration::from_secs(20);

fn supervisor(test_name: &str, mode: SignalMode) -> Supervisor {
    let mut cfg = SupervisorConfig::default();
    cfg.poll_interval = Duration::from_secs(30);
    cfg.join_timeout = Duration::from_millis(500);
    cfg.signal_mode = mode;
    cfg.worker.args = vec![test_name.to_string(), "--exact".to_string()];
    Supervisor::new(cfg, GlobalConfig::default()).with_notifier(NoopNotifier)
}

fn wait_for(registry: &Registry, counter: &str, at_least: i64) -> bool {
    let deadline = Instant::now() + WATCH_LIMIT;
    while Instant::now() < deadline {
        if registry.counters().get(counter).unwrap_or(0) >= at_least {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

fn signal_self(signal: Signal) {
    kill(Pid::this(), signal).unwrap();
}

/// Runs `script` next to the supervisor in the parent only.
fn beside(
    registry: &Arc<Registry>,
    script: impl FnOnce(&Registry) -> bool + Send + 'static,
) -> Option<JoinHandle<bool>> {
    let registry = Arc::clone(registry);
    (!is_worker_process()).then(|| std::thread::spawn(move || script(&registry)))
}

#[test]
fn test_sigterm_in_immediate_mode_stops_at_once() {
    let _serial = SERIAL.lock();
    let mut sup = supervisor("test_sigterm_in_immediate_mode_stops_at_once", SignalMode::Immediate);
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
    let script = beside(&registry, |r| {
        let started = wait_for(r, "started", 1);
        signal_self(Signal::SIGTERM);
        started
    });

    let began = Instant::now();
    let report = sup.start().unwrap();
    assert!(script.unwrap().join().unwrap(), "worker never started");
    assert!(began.elapsed() < Duration::from_secs(10));
    assert_eq!(report.processes_joined, 1);
    assert_eq!(report.processes_killed, 0);
    assert_eq!(report.restarts, 0);
    assert!(report.log_transport_closed);
}

#[test]
fn test_sigint_in_graceful_mode_lets_children_finish() {
    let _serial = SERIAL.lock();
    let mut sup = supervisor(
        "test_sigint_in_graceful_mode_lets_children_finish",
        SignalMode::Graceful,
    );
    for name in ["started", "release", "finished"] {
        sup.registry().counters().register(name, 0);
    }
    // exits on its own once released; never looks at the stop flag
    sup.add(Task::process("batch", |ctx| {
        let counters = ctx.registry().counters();
        counters.increase("started");
        while counters.get("release").unwrap_or(0) == 0 {
            std::thread::sleep(Duration::from_millis(10));
        }
        counters.increase("finished");
        Ok(())
    }))
    .unwrap();

    let registry = Arc::clone(sup.registry());
    let script = beside(&registry, |r| {
        let started = wait_for(r, "started", 1);
        signal_self(Signal::SIGINT);
        std::thread::sleep(Duration::from_millis(300));
        r.counters().increase("release");
        started
    });

    let began = Instant::now();
    let report = sup.start().unwrap();
    assert!(script.unwrap().join().unwrap(), "worker never started");
    assert!(began.elapsed() < Duration::from_secs(10));
    assert_eq!(registry.counters().get("finished"), Some(1));
    // reaped while draining, so shutdown had nothing left to join or kill
    assert_eq!(report.processes_joined, 0);
    assert_eq!(report.processes_killed, 0);
    // a clean exit after the signal is not restarted
    assert_eq!(report.restarts, 0);
    assert_eq!(registry.counters().get("started"), Some(1));
}

#[test]
fn test_second_signal_in_graceful_mode_stops_at_once() {
    let _serial = SERIAL.lock();
    let mut sup = supervisor(
        "test_second_signal_in_graceful_mode_stops_at_once",
        SignalMode::Graceful,
    );
    sup.registry().counters().register("beats", 0);
    sup.add(Task::process("stubborn", |ctx| loop {
        ctx.registry().counters().increase("beats");
        std::thread::sleep(Duration::from_millis(10));
    }))
    .unwrap();

    let registry = Arc::clone(sup.registry());
    let script = beside(&registry, |r| {
        if !wait_for(r, "beats", 1) {
            return false;
        }
        signal_self(Signal::SIGTERM);
        // the first signal alone leaves the worker running
        std::thread::sleep(Duration::from_millis(800));
        let before = r.counters().get("beats").unwrap_or(0);
        std::thread::sleep(Duration::from_millis(100));
        let still_running = r.counters().get("beats").unwrap_or(0) > before;
        signal_self(Signal::SIGTERM);
        still_running
    });

    let report = sup.start().unwrap();
    assert!(script.unwrap().join().unwrap(), "worker stopped after one signal");
    assert_eq!(report.processes_killed, 1);
    assert_eq!(report.restarts, 0);
}
