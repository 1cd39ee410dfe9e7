//! Multi-process logging transport.
//!
//! ```text
//!  worker process                 parent process
//! ┌──────────────┐   MSG_LOG   ┌────────┐      ┌──────────────┐
//! │ tracing ──►  │────────────►│ broker │──┬──►│ rx thread ─► console
//! │ remote chan  │   frames    └────────┘  │   └──────────────┘
//! └──────────────┘          parent tracing─┤   ┌──────────────┐
//!                                          └──►│ rx thread ─► file
//!                                              └──────────────┘
//! ```
//!
//! Producers never block and never fail: a full or closed channel is reported
//! on stderr and the record is dropped.

use parking_lot::Mutex;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::record::{LogLevel, LogRecord};
use super::writer::LogWriter;
use crate::ipc::codec::{encode, write_frame_blocking, MSG_LOG};
use crate::types::{LoggingConfig, Result};

/// Entry side shared by every [`LogSender`] clone.
#[derive(Debug)]
struct Fanout {
    channels: Vec<SyncSender<LogRecord>>,
    closed: AtomicBool,
    warned_closed: AtomicBool,
}

impl Fanout {
    fn new(channels: Vec<SyncSender<LogRecord>>) -> Self {
        Self {
            channels,
            closed: AtomicBool::new(false),
            warned_closed: AtomicBool::new(false),
        }
    }

    fn send(&self, record: LogRecord) {
        if self.closed.load(Ordering::Acquire) {
            self.warn_closed();
            return;
        }
        let last = self.channels.len().saturating_sub(1);
        let mut record = Some(record);
        for (i, channel) in self.channels.iter().enumerate() {
            let item = if i == last {
                record.take()
            } else {
                record.clone()
            };
            let Some(item) = item else { break };
            match channel.try_send(item) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => {
                    eprintln!("log channel full, dropping record: {}", dropped.message);
                }
                Err(TrySendError::Disconnected(_)) => self.warn_closed(),
            }
        }
    }

    fn warn_closed(&self) {
        if !self.warned_closed.swap(true, Ordering::Relaxed) {
            eprintln!("log channel closed, dropping records");
        }
    }
}

/// Cloneable producer handle.
#[derive(Debug, Clone)]
pub struct LogSender {
    inner: Arc<Fanout>,
}

impl LogSender {
    fn new(inner: Arc<Fanout>) -> Self {
        Self { inner }
    }

    /// Enqueue a rendered record. Never blocks, never fails.
    pub fn send(&self, record: LogRecord) {
        self.inner.send(record);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// Parent-side transport: one bounded channel and receiver thread per writer.
#[derive(Debug)]
pub struct LogTransport {
    fanout: Arc<Fanout>,
    levels: Vec<Arc<AtomicU8>>,
    stop: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl LogTransport {
    pub fn start(writers: Vec<Box<dyn LogWriter>>, cfg: &LoggingConfig) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut channels = Vec::with_capacity(writers.len());
        let mut levels = Vec::with_capacity(writers.len());
        let mut threads = Vec::with_capacity(writers.len());

        for writer in writers {
            let (tx, rx) = mpsc::sync_channel(cfg.channel_capacity.max(1));
            let level = Arc::new(AtomicU8::new(writer.level().to_u8()));
            let thread_name = format!("log-rx-{}", writer.name());
            let handle = {
                let level = Arc::clone(&level);
                let stop = Arc::clone(&stop);
                let poll = cfg.poll_interval;
                std::thread::Builder::new()
                    .name(thread_name)
                    .spawn(move || receive_loop(writer, rx, level, stop, poll))?
            };
            channels.push(tx);
            levels.push(level);
            threads.push(handle);
        }

        Ok(Self {
            fanout: Arc::new(Fanout::new(channels)),
            levels,
            stop,
            threads: Mutex::new(threads),
        })
    }

    pub fn sender(&self) -> LogSender {
        LogSender::new(Arc::clone(&self.fanout))
    }

    /// Change the minimum level of every writer.
    pub fn set_level(&self, level: LogLevel) {
        for slot in &self.levels {
            slot.store(level.to_u8(), Ordering::Release);
        }
    }

    /// Lowest level any writer currently accepts.
    pub fn min_level(&self) -> LogLevel {
        self.levels
            .iter()
            .map(|slot| LogLevel::from_u8(slot.load(Ordering::Acquire)))
            .min()
            .unwrap_or_default()
    }

    /// Stop accepting records, drain what is queued, close every writer and
    /// join the receiver threads. Idempotent.
    pub fn close(&self) {
        self.fanout.closed.store(true, Ordering::Release);
        self.stop.store(true, Ordering::Release);
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                eprintln!("log receiver thread panicked");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.fanout.closed.load(Ordering::Acquire)
    }
}

impl Drop for LogTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn deliver(writer: &mut dyn LogWriter, level: &AtomicU8, record: &LogRecord) {
    let wanted = LogLevel::from_u8(level.load(Ordering::Acquire));
    if writer.level() != wanted {
        writer.set_level(wanted);
    }
    if record.level < wanted {
        return;
    }
    if let Err(e) = writer.emit(record) {
        eprintln!("log writer {} failed: {}", writer.name(), e);
    }
}

fn receive_loop(
    mut writer: Box<dyn LogWriter>,
    rx: Receiver<LogRecord>,
    level: Arc<AtomicU8>,
    stop: Arc<AtomicBool>,
    poll: Duration,
) {
    loop {
        match rx.recv_timeout(poll) {
            Ok(record) => deliver(writer.as_mut(), &level, &record),
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    while let Ok(record) = rx.try_recv() {
        deliver(writer.as_mut(), &level, &record);
    }
    writer.close();
}

/// Worker-side log channel: records are buffered and forwarded to the
/// parent's broker as `MSG_LOG` frames by a single thread.
#[derive(Debug)]
pub struct RemoteLogChannel {
    fanout: Arc<Fanout>,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteLogChannel {
    pub fn connect(socket: &Path, capacity: usize, poll: Duration) -> Result<Self> {
        let stream = UnixStream::connect(socket)?;
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("log-forward".to_string())
                .spawn(move || forward_loop(stream, rx, stop, poll))?
        };
        Ok(Self {
            fanout: Arc::new(Fanout::new(vec![tx])),
            stop,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn sender(&self) -> LogSender {
        LogSender::new(Arc::clone(&self.fanout))
    }

    /// Flush pending records to the broker and join the forwarder.
    pub fn close(&self) {
        self.fanout.closed.store(true, Ordering::Release);
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                eprintln!("log forwarder thread panicked");
            }
        }
    }
}

impl Drop for RemoteLogChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn forward(stream: &mut UnixStream, record: &LogRecord, broken: &mut bool) {
    if *broken {
        return;
    }
    let result = encode(record).and_then(|payload| {
        write_frame_blocking(stream, MSG_LOG, &payload).map_err(Into::into)
    });
    if let Err(e) = result {
        eprintln!("log forwarding to parent failed, dropping records: {}", e);
        *broken = true;
    }
}

fn forward_loop(
    mut stream: UnixStream,
    rx: Receiver<LogRecord>,
    stop: Arc<AtomicBool>,
    poll: Duration,
) {
    let mut broken = false;
    loop {
        match rx.recv_timeout(poll) {
            Ok(record) => forward(&mut stream, &record, &mut broken),
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    while let Ok(record) = rx.try_recv() {
        forward(&mut stream, &record, &mut broken);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::codec::{decode, read_frame_blocking};

    /// Writer that records into a shared vector.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct MemoryWriter {
        pub(crate) records: Arc<Mutex<Vec<LogRecord>>>,
        pub(crate) closed: Arc<AtomicBool>,
        level: LogLevel,
    }

    impl MemoryWriter {
        fn with_level(level: LogLevel) -> Self {
            Self {
                level,
                ..Self::default()
            }
        }
    }

    impl LogWriter for MemoryWriter {
        fn name(&self) -> &str {
            "memory"
        }
        fn level(&self) -> LogLevel {
            self.level
        }
        fn set_level(&mut self, level: LogLevel) {
            self.level = level;
        }
        fn emit(&mut self, record: &LogRecord) -> std::io::Result<()> {
            self.records.lock().push(record.clone());
            Ok(())
        }
        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn cfg() -> LoggingConfig {
        LoggingConfig {
            channel_capacity: 64,
            poll_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_every_writer_sees_every_record() {
        let a = MemoryWriter::with_level(LogLevel::Info);
        let b = MemoryWriter::with_level(LogLevel::Info);
        let transport =
            LogTransport::start(vec![Box::new(a.clone()), Box::new(b.clone())], &cfg()).unwrap();
        let sender = transport.sender();
        for i in 0..10 {
            sender.send(LogRecord::new(LogLevel::Info, "t", format!("m{}", i)));
        }
        transport.close();

        for writer in [&a, &b] {
            let messages: Vec<String> =
                writer.records.lock().iter().map(|r| r.message.clone()).collect();
            assert_eq!(messages, (0..10).map(|i| format!("m{}", i)).collect::<Vec<_>>());
            assert!(writer.closed.load(Ordering::SeqCst));
        }
    }

    #[test]
    fn test_level_filter_and_set_level() {
        let w = MemoryWriter::with_level(LogLevel::Warn);
        let transport = LogTransport::start(vec![Box::new(w.clone())], &cfg()).unwrap();
        let sender = transport.sender();
        sender.send(LogRecord::new(LogLevel::Info, "t", "dropped"));
        sender.send(LogRecord::new(LogLevel::Error, "t", "kept"));
        assert_eq!(transport.min_level(), LogLevel::Warn);

        // drain before changing the level
        std::thread::sleep(Duration::from_millis(100));
        transport.set_level(LogLevel::Debug);
        sender.send(LogRecord::new(LogLevel::Debug, "t", "now kept"));
        transport.close();

        let messages: Vec<String> = w.records.lock().iter().map(|r| r.message.clone()).collect();
        assert_eq!(messages, vec!["kept".to_string(), "now kept".to_string()]);
    }

    #[test]
    fn test_send_after_close_is_silent() {
        let w = MemoryWriter::default();
        let transport = LogTransport::start(vec![Box::new(w.clone())], &cfg()).unwrap();
        let sender = transport.sender();
        transport.close();
        assert!(transport.is_closed());
        assert!(sender.is_closed());
        sender.send(LogRecord::new(LogLevel::Error, "t", "late"));
        sender.send(LogRecord::new(LogLevel::Error, "t", "later"));
        assert!(w.records.lock().is_empty());
        // second close is a no-op
        transport.close();
    }

    #[test]
    fn test_full_channel_drops_instead_of_blocking() {
        #[derive(Debug)]
        struct SlowWriter;
        impl LogWriter for SlowWriter {
            fn name(&self) -> &str {
                "slow"
            }
            fn level(&self) -> LogLevel {
                LogLevel::Trace
            }
            fn set_level(&mut self, _: LogLevel) {}
            fn emit(&mut self, _: &LogRecord) -> std::io::Result<()> {
                std::thread::sleep(Duration::from_millis(50));
                Ok(())
            }
        }

        let cfg = LoggingConfig {
            channel_capacity: 1,
            poll_interval: Duration::from_millis(10),
        };
        let transport = LogTransport::start(vec![Box::new(SlowWriter)], &cfg).unwrap();
        let sender = transport.sender();
        let started = std::time::Instant::now();
        for _ in 0..20 {
            sender.send(LogRecord::new(LogLevel::Info, "t", "burst"));
        }
        assert!(started.elapsed() < Duration::from_millis(500));
        transport.close();
    }

    #[test]
    fn test_remote_channel_writes_log_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.sock");
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let channel = RemoteLogChannel::connect(&path, 16, Duration::from_millis(10)).unwrap();
        let (mut conn, _) = listener.accept().unwrap();
        let sender = channel.sender();
        sender.send(LogRecord::new(LogLevel::Warn, "worker", "from child"));
        channel.close();

        let (ty, body) = read_frame_blocking(&mut conn, 1 << 20).unwrap().unwrap();
        assert_eq!(ty, MSG_LOG);
        let record: LogRecord = decode(&body).unwrap();
        assert_eq!(record.message, "from child");
        assert_eq!(record.level, LogLevel::Warn);
    }
}
