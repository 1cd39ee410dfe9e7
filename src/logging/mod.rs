//! Logging transport: funnels records from every unit into one writer set.

mod layer;
mod record;
mod transport;
mod writer;

pub use layer::ChannelLayer;
pub use record::{LogFormat, LogLevel, LogRecord};
pub use transport::{LogSender, LogTransport, RemoteLogChannel};
pub use writer::{build_writers, ConsoleWriter, FileWriter, LogWriter};
