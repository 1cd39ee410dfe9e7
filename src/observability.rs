//! Observability utilities.

use std::sync::OnceLock;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::logging::{ChannelLayer, LogLevel, LogSender};

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Initialize the tracing subscriber once for the process.
///
/// Every event is rendered into a record and handed to `sender`, which leads
/// to the local writer set in the parent and to the broker in a worker.
/// Filter defaults to `default_level` if `RUST_LOG` is unset. Returns `false`
/// when this call did not install the subscriber.
pub fn init_tracing(sender: LogSender, default_level: LogLevel) -> bool {
    let mut installed = false;
    TRACING_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level.as_str()));

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(ChannelLayer::new(sender))
            .try_init();

        match result {
            Ok(()) => installed = true,
            Err(err) => eprintln!("tracing init skipped: {err}"),
        }
    });
    installed
}
