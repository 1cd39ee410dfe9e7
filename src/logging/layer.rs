//! `tracing` layer feeding the logging transport.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::record::{LogLevel, LogRecord};
use super::transport::LogSender;

/// Renders every event into a [`LogRecord`] and sends it down the channel.
#[derive(Debug, Clone)]
pub struct ChannelLayer {
    sender: LogSender,
}

impl ChannelLayer {
    pub fn new(sender: LogSender) -> Self {
        Self { sender }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        // errors are flattened to text here so the record stays plain data
        let mut rendered = value.to_string();
        let mut source = value.source();
        while let Some(cause) = source {
            let _ = write!(rendered, ": {}", cause);
            source = cause.source();
        }
        self.fields.insert(field.name().to_string(), rendered);
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            self.fields
                .insert(field.name().to_string(), format!("{:?}", value));
        }
    }
}

impl<S: Subscriber> Layer<S> for ChannelLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut record = LogRecord::new(LogLevel::from(meta.level()), meta.target(), visitor.message);
        record.fields = visitor.fields;
        record.file = meta.file().map(str::to_string);
        record.line = meta.line();
        self.sender.send(record);
    }
}
