//! Log writers: the sinks the transport delivers records to.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use super::record::{LogFormat, LogLevel, LogRecord};
use crate::types::{RunningConfig, WriterSpec};

/// A log sink. Each writer is owned by exactly one receiver thread.
pub trait LogWriter: Send + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Minimum level this writer emits.
    fn level(&self) -> LogLevel;

    fn set_level(&mut self, level: LogLevel);

    fn emit(&mut self, record: &LogRecord) -> std::io::Result<()>;

    /// Flush and release resources. Called once, after the last `emit`.
    fn close(&mut self) {}
}

/// Writes rendered records to stderr.
#[derive(Debug)]
pub struct ConsoleWriter {
    level: LogLevel,
    format: LogFormat,
}

impl ConsoleWriter {
    pub fn new(level: LogLevel, format: LogFormat) -> Self {
        Self { level, format }
    }
}

impl LogWriter for ConsoleWriter {
    fn name(&self) -> &str {
        "console"
    }

    fn level(&self) -> LogLevel {
        self.level
    }

    fn set_level(&mut self, level: LogLevel) {
        self.level = level;
    }

    fn emit(&mut self, record: &LogRecord) -> std::io::Result<()> {
        let mut err = std::io::stderr().lock();
        writeln!(err, "{}", record.render(self.format))
    }

    fn close(&mut self) {
        let _ = std::io::stderr().flush();
    }
}

/// Appends rendered records to `<log_path>/<prefix><filename>`.
///
/// The file is opened on the first record; no rotation.
#[derive(Debug)]
pub struct FileWriter {
    name: String,
    path: PathBuf,
    level: LogLevel,
    format: LogFormat,
    out: Option<BufWriter<File>>,
}

impl FileWriter {
    pub fn new(spec: &WriterSpec, running: &RunningConfig) -> Self {
        let file_name = format!("{}{}", running.log_file_prefix, spec.filename);
        Self {
            name: format!("file:{}", file_name),
            path: spec.log_path.join(file_name),
            level: spec.level,
            format: spec.format,
            out: None,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn open(&mut self) -> std::io::Result<&mut BufWriter<File>> {
        if self.out.is_none() {
            if let Some(dir) = self.path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.out = Some(BufWriter::new(file));
        }
        self.out
            .as_mut()
            .ok_or_else(|| std::io::Error::other("log file not open"))
    }
}

impl LogWriter for FileWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn level(&self) -> LogLevel {
        self.level
    }

    fn set_level(&mut self, level: LogLevel) {
        self.level = level;
    }

    fn emit(&mut self, record: &LogRecord) -> std::io::Result<()> {
        let line = record.render(self.format);
        let out = self.open()?;
        writeln!(out, "{}", line)?;
        out.flush()
    }

    fn close(&mut self) {
        if let Some(mut out) = self.out.take() {
            if let Err(e) = out.flush() {
                eprintln!("log writer {}: flush failed: {}", self.name, e);
            }
        }
    }
}

/// Build writers from configuration. Unknown kinds are skipped; an empty
/// result falls back to a console writer at info level.
pub fn build_writers(specs: &[WriterSpec], running: &RunningConfig) -> Vec<Box<dyn LogWriter>> {
    let mut writers: Vec<Box<dyn LogWriter>> = Vec::with_capacity(specs.len());
    for spec in specs {
        match spec.writer.as_str() {
            "console" => writers.push(Box::new(ConsoleWriter::new(spec.level, spec.format))),
            "file" => writers.push(Box::new(FileWriter::new(spec, running))),
            other => eprintln!("unknown log writer kind {:?}, skipping", other),
        }
    }
    if writers.is_empty() {
        writers.push(Box::new(ConsoleWriter::new(LogLevel::Info, LogFormat::Text)));
    }
    writers
}
