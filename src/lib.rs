//! # Jeeves Procvisor - Process Supervision with Shared Primitives
//!
//! Supervises a group of named units (separate processes or in-process
//! threads) and gives all of them one shared namespace of synchronization
//! primitives:
//! - Restart-on-exit supervision driven by child exits, with a two-tier
//!   (immediate / graceful) termination path
//! - Named counters, mutexes, reentrant locks, semaphores and bounded queues
//!   that behave the same from every process
//! - A logging transport funnelling every unit's records into the parent's
//!   writers
//!
//! ## Architecture
//!
//! The parent owns every real object; workers reach it over one Unix socket:
//! ```text
//!   ┌──────────────── parent ────────────────┐
//!   │ Supervisor ── control loop ◄── signals │
//!   │   │                                    │
//!   │   ├── Registry (counters, locks, ...)  │
//!   │   ├── LogTransport ──► writers         │      ┌──── worker ────┐
//!   │   └── Broker ◄─────────── socket ──────┼──────│ BrokerClient   │
//!   │         ▲ staged spawn payloads        │      │ Registry (rem.)│
//!   └─────────┼──────────────────────────────┘      │ RemoteLogChan. │
//!             └──────── attach(token) ──────────────┤ unit fn        │
//!                                                   └────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod ipc;
pub mod logging;
pub mod notify;
pub mod supervisor;
pub mod sync;
pub mod types;

// Internal utilities
pub mod observability;

pub use notify::{NoopNotifier, Notifier, TracingNotifier};
pub use supervisor::{
    is_worker_process, ShutdownHandle, ShutdownReport, Supervisor, Task, UnitKind, WorkerContext,
};
pub use sync::{ExecutionContext, Registry};
pub use types::{
    BackoffRange, Error, GlobalConfig, IpcConfig, LoggingConfig, Result, RunningConfig,
    SignalMode, SupervisorConfig, WorkerCommand, WorkerError, WriterSpec,
};
