use std::time::Duration;

use baler_types::error::{BalerError, Result};

use crate::RetryConfig;

/// Retry a closure on transient I/O errors with exponential backoff + jitter.
///
/// Rate-limit responses are returned immediately: they carry a retry-after
/// hint that belongs to the scheduling layer, not to this loop.
pub fn retry_io<T>(
    config: &RetryConfig,
    op_name: &str,
    backend_label: &str,
    f: impl Fn() -> Result<T>,
) -> Result<T> {
    let mut delay_ms = config.retry_delay_ms;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let jitter = rand::random::<u64>() % delay_ms.max(1);
            std::thread::sleep(Duration::from_millis(delay_ms + jitter));
            delay_ms = (delay_ms * 2).min(config.retry_max_delay_ms);
        }
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if is_retryable(&e) && attempt < config.max_retries => {
                tracing::warn!(
                    "{backend_label} {op_name}: transient error (attempt {}/{}), retrying: {e}",
                    attempt + 1,
                    config.max_retries,
                );
            }
            Err(e) => return Err(e),
        }
    }
    Err(BalerError::Other(format!(
        "{backend_label} {op_name}: retries exhausted"
    )))
}

/// Whether an error is transient and worth retrying within one invocation.
pub fn is_retryable(err: &BalerError) -> bool {
    match err {
        BalerError::Io(e) => is_retryable_io(e),
        _ => false,
    }
}

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}
