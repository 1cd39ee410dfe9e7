//! Panic recovery for unit functions and hooks.
//!
//! A panicking unit must look exactly like a failing one to the supervisor:
//! logged, reported to the notifier, and (for a process) exiting non-zero.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::types::{Error, WorkerError};

/// Execute a function with panic recovery.
///
/// If the function panics, the panic is captured, logged, and converted
/// to [`WorkerError::Failed`].
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T, WorkerError>
where
    F: FnOnce() -> Result<T, WorkerError>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(&panic_payload);
            tracing::error!(
                "panic_recovered: operation={}, panic={}",
                operation_name,
                panic_msg
            );

            Err(WorkerError::from(Error::internal(format!(
                "Panic in {}: {}",
                operation_name, panic_msg
            ))))
        }
    }
}

/// Extract panic message from panic payload.
fn extract_panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}
