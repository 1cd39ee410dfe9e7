//! Configuration structures.
//!
//! `SupervisorConfig` carries the runtime knobs of the supervisor itself.
//! `GlobalConfig` wraps the snapshot handed over by the configuration
//! collaborator; the core only reads the writer list and the `running`
//! sub-record from it. Loading and parsing config files happens elsewhere.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use crate::logging::{LogFormat, LogLevel};

/// Supervisor runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Liveness heartbeat of the control loop.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long each process unit gets to exit on shutdown before it is killed.
    #[serde(with = "humantime_serde")]
    pub join_timeout: Duration,

    /// Master switch for restart-on-exit. When off, exited units are only
    /// dropped from tracking.
    pub auto_restart: bool,

    /// Reaction to SIGINT/SIGTERM.
    pub signal_mode: SignalMode,

    /// Random wait range for a semaphore `lock`.
    pub semaphore_backoff: BackoffRange,

    /// Capacity used when a queue is registered without one.
    pub queue_capacity: usize,

    /// Default execution-context timeout attached to pushed queue items.
    #[serde(with = "humantime_serde")]
    pub queue_item_timeout: Duration,

    /// Logging transport configuration.
    pub logging: LoggingConfig,

    /// Broker socket configuration.
    pub ipc: IpcConfig,

    /// How worker processes are launched.
    pub worker: WorkerCommand,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            join_timeout: Duration::from_secs(3),
            auto_restart: true,
            signal_mode: SignalMode::default(),
            semaphore_backoff: BackoffRange::default(),
            queue_capacity: 1024,
            queue_item_timeout: Duration::from_secs(30),
            logging: LoggingConfig::default(),
            ipc: IpcConfig::default(),
            worker: WorkerCommand::default(),
        }
    }
}

/// Two-tier termination handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignalMode {
    /// Leave the poll loop as soon as the signal is delivered.
    #[default]
    Immediate,
    /// Stop restarting and keep reaping until every child has exited on its
    /// own. A second signal leaves the poll loop at once.
    Graceful,
}

/// Inclusive range a semaphore acquire waits for before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawBackoffRange")]
pub struct BackoffRange {
    #[serde(with = "humantime_serde")]
    pub min: Duration,
    #[serde(with = "humantime_serde")]
    pub max: Duration,
}

/// Bounds as written in a config file, possibly swapped.
#[derive(Deserialize)]
struct RawBackoffRange {
    #[serde(with = "humantime_serde")]
    min: Duration,
    #[serde(with = "humantime_serde")]
    max: Duration,
}

impl From<RawBackoffRange> for BackoffRange {
    fn from(raw: RawBackoffRange) -> Self {
        Self::new(raw.min, raw.max)
    }
}

impl BackoffRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    /// Draw a wait duration uniformly from the range.
    pub fn sample(&self) -> Duration {
        use rand::Rng;

        // public fields may hold swapped bounds
        let (lo, hi) = if self.min <= self.max {
            (self.min, self.max)
        } else {
            (self.max, self.min)
        };
        let lo = u64::try_from(lo.as_millis()).unwrap_or(u64::MAX);
        let hi = u64::try_from(hi.as_millis()).unwrap_or(u64::MAX);
        if lo == hi {
            return Duration::from_millis(lo);
        }
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }
}

impl Default for BackoffRange {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(3),
        }
    }
}

/// Logging transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Bound of each record channel.
    pub channel_capacity: usize,

    /// Receive timeout of the receiver loops; bounds how long a close takes
    /// to be observed.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 4096,
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Broker transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Directory for the broker socket. Defaults to the system temp dir.
    pub socket_dir: Option<PathBuf>,

    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_dir: None,
            max_frame_bytes: 5 * 1024 * 1024,
        }
    }
}

/// Command line used to start worker processes.
///
/// Workers re-execute `program` (the current executable by default) with
/// `args`; the worker identity travels in the environment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorkerCommand {
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
}

/// One configured log writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterSpec {
    /// Writer kind: `console` or `file`.
    pub writer: String,
    pub level: LogLevel,
    pub format: LogFormat,
    pub filename: String,
    pub log_path: PathBuf,
}

impl Default for WriterSpec {
    fn default() -> Self {
        Self {
            writer: "console".to_string(),
            level: LogLevel::Info,
            format: LogFormat::Text,
            filename: "info.log".to_string(),
            log_path: PathBuf::from("log"),
        }
    }
}

/// Per-run settings injected by the host next to the loaded config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RunningConfig {
    /// Prepended to every file writer's file name.
    pub log_file_prefix: String,
}

const LOG_KEY: &str = "log";
const RUNNING_KEY: &str = "running";

/// Snapshot of the global configuration mapping.
///
/// Cloned into every worker process so that workers see the same settings as
/// the parent without re-reading any file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig(Value);

impl GlobalConfig {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// The whole mapping.
    pub fn global_config(&self) -> &Value {
        &self.0
    }

    /// Configured log writers. Entries that fail to parse are skipped.
    pub fn writer_list(&self) -> Vec<WriterSpec> {
        let Some(items) = self.0.get(LOG_KEY).and_then(Value::as_array) else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| match serde_json::from_value(item.clone()) {
                Ok(spec) => Some(spec),
                Err(e) => {
                    tracing::warn!("writer_spec_invalid: {} ({})", item, e);
                    None
                }
            })
            .collect()
    }

    /// The `running` sub-record; defaults when absent.
    pub fn running(&self) -> RunningConfig {
        self.0
            .get(RUNNING_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Record the per-run log file prefix.
    pub fn with_running(mut self, running: RunningConfig) -> Self {
        if !self.0.is_object() {
            self.0 = Value::Object(serde_json::Map::new());
        }
        if let (Value::Object(map), Ok(value)) = (&mut self.0, serde_json::to_value(running)) {
            map.insert(RUNNING_KEY.to_string(), value);
        }
        self
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self(Value::Object(serde_json::Map::new()))
    }
}
