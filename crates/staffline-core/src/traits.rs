use chrono::{DateTime, NaiveDate, Utc};
use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{ProviderRequest, ProviderResponse};

/// External integration provider such as e-signature or background check.
///
/// A failed send (rejection, timeout, 5xx) is returned as an error; the
/// dispatcher decides whether the attempt budget allows another try.
pub trait IntegrationProvider: Send + Sync + 'static {
    /// Provider name (used in logs and error messages).
    fn name(&self) -> &str;

    /// Send one request to the provider.
    fn send(&self, request: ProviderRequest) -> BoxFuture<'_, Result<ProviderResponse>>;

    /// Upper bound on a single send, enforced by the dispatcher.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Source of the current time, injectable for date-driven behaviour (overdue, retries).
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
