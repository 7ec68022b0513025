use chrono::Duration;
use tracing::warn;

use staffline_core::config::RetryConfig;
use staffline_core::error::{Result, StafflineError};
use staffline_store::{SqliteStore, StoreTx};

/// Delay before the next integration attempt. `failures` is the number of
/// failed attempts so far (1 after the first failure).
pub fn calculate_backoff(failures: u32, config: &RetryConfig) -> Duration {
    let exp = failures.saturating_sub(1).min(20);
    let secs = config
        .initial_backoff_secs
        .saturating_mul(2u64.pow(exp))
        .min(config.max_backoff_secs);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::milliseconds((secs as f64 * 1000.0 * jitter) as i64)
}

/// Whether a failed write may be tried again.
pub(crate) fn is_retryable(e: &StafflineError) -> bool {
    matches!(e, StafflineError::Conflict(_))
}

/// Run a write transaction, retrying it up to `retries` times on a
/// concurrent-modification conflict. A conflict that outlasts the budget is
/// returned as is.
pub(crate) fn write_with_retry<T>(
    store: &SqliteStore,
    retries: u32,
    mut f: impl FnMut(&StoreTx<'_>) -> Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        match store.write(&mut f) {
            Err(e) if is_retryable(&e) && attempt < retries => {
                attempt += 1;
                warn!(attempt, retries, error = %e, "Write conflict, retrying transaction");
            }
            other => return other,
        }
    }
}
