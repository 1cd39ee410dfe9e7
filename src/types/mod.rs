//! Core types shared by every component.
//!
//! - **IDs**: Strongly-typed identifiers (SpawnToken, OwnerId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Supervisor, logging, broker and global configuration

mod config;
mod errors;
mod ids;

pub use config::{
    BackoffRange, GlobalConfig, IpcConfig, LoggingConfig, RunningConfig, SignalMode,
    SupervisorConfig, WorkerCommand, WriterSpec,
};
pub use errors::{Error, Result, WorkerError};
pub use ids::{OwnerId, SpawnToken};
