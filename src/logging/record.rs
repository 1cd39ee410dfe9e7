//! Log records and levels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::types::Error;

/// Record severity, ordered from most to least verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(n: u8) -> Self {
        match n {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" | "critical" => Ok(LogLevel::Error),
            other => Err(Error::config(format!("unknown log level: {}", other))),
        }
    }
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

/// Writer output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// A fully rendered log record.
///
/// Everything is already a string by the time a record is queued, so the
/// receiving side never needs the producer's context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    pub pid: u32,
    pub thread: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl LogRecord {
    pub fn new(level: LogLevel, target: impl Into<String>, message: impl Into<String>) -> Self {
        let thread = std::thread::current();
        Self {
            timestamp: Utc::now(),
            level,
            target: target.into(),
            message: message.into(),
            fields: BTreeMap::new(),
            pid: std::process::id(),
            thread: thread
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{:?}", thread.id())),
            file: None,
            line: None,
        }
    }

    /// `[ts][LEVEL][file:line][pid][message key=value...]`
    pub fn render_text(&self) -> String {
        let location = match (&self.file, self.line) {
            (Some(file), Some(line)) => format!("{}:{}", file, line),
            (Some(file), None) => file.clone(),
            _ => self.target.clone(),
        };
        let mut message = self.message.clone();
        for (key, value) in &self.fields {
            message.push_str(&format!(" {}={}", key, value));
        }
        format!(
            "[{}][{}][{}][{}][{}]",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.level.as_str().to_ascii_uppercase(),
            location,
            self.pid,
            message
        )
    }

    pub fn render_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"level":"error","message":"unrenderable record: {}"}}"#, e)
        })
    }

    pub fn render(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Text => self.render_text(),
            LogFormat::Json => self.render_json(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering_and_parsing() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
        for level in [LogLevel::Trace, LogLevel::Info, LogLevel::Error] {
            assert_eq!(LogLevel::from_u8(level.to_u8()), level);
        }
    }

    #[test]
    fn test_render_text_layout() {
        let mut record = LogRecord::new(LogLevel::Warn, "svc", "queue full");
        record.file = Some("src/worker.rs".to_string());
        record.line = Some(42);
        record.fields.insert("queue".to_string(), "jobs".to_string());
        let text = record.render_text();
        assert!(text.contains("[WARN][src/worker.rs:42]"));
        assert!(text.contains(&format!("[{}]", std::process::id())));
        assert!(text.ends_with("[queue full queue=jobs]"));
    }

    #[test]
    fn test_render_json_parses_back() {
        let record = LogRecord::new(LogLevel::Info, "svc", "hello");
        let back: LogRecord = serde_json::from_str(&record.render(LogFormat::Json)).unwrap();
        assert_eq!(back, record);
    }
}
