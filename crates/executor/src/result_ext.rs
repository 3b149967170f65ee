//! Logging for failures on the side-effect path, whether they are propagated
//! or only reported, such as best-effort execution events.

use std::fmt::Display;
use tracing::error;

pub trait ResultExt<T, E> {
    /// Log the error with `context` and the caller's location, then return
    /// the result unchanged.
    ///
    /// ```ignore
    /// let _ = publish_json(&*queue, EXECUTION_EVENTS_TOPIC, key, &execution)
    ///     .await
    ///     .log("publishing execution event");
    /// ```
    fn log<S: Display>(self, context: S) -> Result<T, E>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: Display>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let location = std::panic::Location::caller();
            error!(
                target: "floe_executor",
                error = %e,
                context = %context,
                location = %format_args!("{}:{}", location.file(), location.line()),
                "Operation failed"
            );
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutorError;

    #[test]
    fn test_log_passes_result_through() {
        let ok: Result<u8, ExecutorError> = Ok(1);
        assert_eq!(ok.log("nothing to report").unwrap(), 1);

        let err: Result<u8, ExecutorError> = Err(ExecutorError::Queue("broker down".to_string()));
        assert!(matches!(
            err.log(format!("publishing to {}", "worker_tasks")),
            Err(ExecutorError::Queue(_))
        ));
    }
}
