//! Supervised unit state machine and exit classification.
//!
//! Pending → Running → {ExitedClean | ExitedCrashed} → {Restarting → Running | Terminated}
//!
//! A graceful exit or a kill on shutdown goes straight from Running to
//! Terminated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ExitStatus};
use std::thread::JoinHandle;

use super::task::Task;
use crate::types::{Error, Result, SpawnToken};

/// Exit code of a unit that stopped on request.
pub const GRACEFUL_EXIT_CODE: i32 = 130;

/// Unit lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    Running,
    ExitedClean,
    ExitedCrashed,
    Restarting,
    Terminated,
}

impl UnitState {
    pub fn can_transition_to(self, to: UnitState) -> bool {
        match (self, to) {
            // PENDING
            (UnitState::Pending, UnitState::Running) => true,
            (UnitState::Pending, UnitState::Terminated) => true, // spawn failed
            // RUNNING
            (UnitState::Running, UnitState::ExitedClean) => true,
            (UnitState::Running, UnitState::ExitedCrashed) => true,
            (UnitState::Running, UnitState::Terminated) => true, // graceful or killed
            // EXITED
            (UnitState::ExitedClean | UnitState::ExitedCrashed, UnitState::Restarting) => true,
            (UnitState::ExitedClean | UnitState::ExitedCrashed, UnitState::Terminated) => true,
            // RESTARTING
            (UnitState::Restarting, UnitState::Running) => true,
            (UnitState::Restarting, UnitState::Terminated) => true,
            // TERMINATED is final
            (UnitState::Terminated, _) => false,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == UnitState::Terminated
    }
}

/// How a process unit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exit code 0.
    Clean,
    /// [`GRACEFUL_EXIT_CODE`], or death by SIGINT/SIGTERM.
    Graceful,
    /// Anything else.
    Crashed,
}

impl ExitKind {
    pub fn classify(status: &ExitStatus) -> Self {
        match status.code() {
            Some(0) => ExitKind::Clean,
            Some(GRACEFUL_EXIT_CODE) => ExitKind::Graceful,
            Some(_) => ExitKind::Crashed,
            None => match status.signal() {
                Some(sig)
                    if sig == nix::sys::signal::Signal::SIGINT as i32
                        || sig == nix::sys::signal::Signal::SIGTERM as i32 =>
                {
                    ExitKind::Graceful
                }
                _ => ExitKind::Crashed,
            },
        }
    }

    /// State a running unit moves to on this exit.
    pub fn next_state(self) -> UnitState {
        match self {
            ExitKind::Clean => UnitState::ExitedClean,
            ExitKind::Crashed => UnitState::ExitedCrashed,
            ExitKind::Graceful => UnitState::Terminated,
        }
    }
}

fn transition(name: &str, state: &mut UnitState, to: UnitState) -> Result<()> {
    if !state.can_transition_to(to) {
        return Err(Error::internal(format!(
            "unit {}: invalid state transition {:?} -> {:?}",
            name, state, to
        )));
    }
    *state = to;
    Ok(())
}

/// A supervised child process.
#[derive(Debug)]
pub(crate) struct ProcessUnit {
    pub(crate) task: Task,
    pub(crate) child: Child,
    /// Token the child's spawn payload is staged under until it attaches.
    pub(crate) token: SpawnToken,
    pub(crate) state: UnitState,
    pub(crate) started_at: DateTime<Utc>,
}

impl ProcessUnit {
    pub(crate) fn new(task: Task, child: Child, token: SpawnToken) -> Self {
        Self {
            task,
            child,
            token,
            state: UnitState::Running,
            started_at: Utc::now(),
        }
    }

    pub(crate) fn pid(&self) -> u32 {
        self.child.id()
    }

    pub(crate) fn transition(&mut self, to: UnitState) -> Result<()> {
        transition(&self.task.name, &mut self.state, to)
    }
}

/// A supervised thread inside the parent.
#[derive(Debug)]
pub(crate) struct ThreadUnit {
    pub(crate) name: String,
    pub(crate) handle: JoinHandle<()>,
}

impl ThreadUnit {
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
