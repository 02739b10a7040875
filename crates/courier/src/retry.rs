//! Automatic retry with exponential backoff.
//!
//! [`RetryPolicy`] retries transient transport failures (timeouts, DNS and
//! connection errors) and a configurable set of HTTP status codes that were
//! rejected by status-code validation. It never retries past `retry_limit`.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, TransportErrorKind};
use crate::interceptor::{RequestRetrier, RetryDecision, RetryFuture};
use crate::request::Request;

/// Default number of retries.
pub const DEFAULT_RETRY_LIMIT: u32 = 2;
/// Default backoff base.
pub const DEFAULT_EXPONENTIAL_BACKOFF_BASE: u32 = 2;
/// Default backoff scale, in seconds.
pub const DEFAULT_EXPONENTIAL_BACKOFF_SCALE: f64 = 0.5;
/// Default retryable status codes.
pub const DEFAULT_RETRYABLE_STATUS_CODES: [u16; 5] = [408, 500, 502, 503, 504];

/// Retrier that backs off exponentially: `base ^ retry_count * scale` seconds.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = fail immediately).
    pub retry_limit: u32,
    pub exponential_backoff_base: u32,
    /// Seconds multiplied into every delay.
    pub exponential_backoff_scale: f64,
    /// Status codes retried when status validation rejects them.
    pub retryable_status_codes: HashSet<u16>,
    pub retryable_transport_errors: HashSet<TransportErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_limit: DEFAULT_RETRY_LIMIT,
            exponential_backoff_base: DEFAULT_EXPONENTIAL_BACKOFF_BASE,
            exponential_backoff_scale: DEFAULT_EXPONENTIAL_BACKOFF_SCALE,
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.into_iter().collect(),
            retryable_transport_errors: TransportErrorKind::DEFAULT_RETRYABLE
                .into_iter()
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given retry limit and default backoff.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            retry_limit: retries,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, base: u32, scale: f64) -> Self {
        self.exponential_backoff_base = base;
        self.exponential_backoff_scale = scale;
        self
    }

    pub fn with_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn with_transport_errors(
        mut self,
        kinds: impl IntoIterator<Item = TransportErrorKind>,
    ) -> Self {
        self.retryable_transport_errors = kinds.into_iter().collect();
        self
    }

    /// Delay before retry number `attempt + 1` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = f64::from(self.exponential_backoff_base).powi(exponent);
        let seconds = factor * self.exponential_backoff_scale;
        if seconds.is_nan() || seconds <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }

    /// Whether `error` is one this policy considers transient.
    pub fn is_retryable(&self, error: &Error) -> bool {
        if let Some(transport) = error.transport_error() {
            return self.retryable_transport_errors.contains(&transport.kind);
        }
        error
            .response_code()
            .is_some_and(|code| self.retryable_status_codes.contains(&code))
    }

    /// Decide for a request that has already been retried `retry_count` times.
    pub fn decide(&self, retry_count: u32, error: &Error) -> RetryDecision {
        if retry_count >= self.retry_limit {
            debug!(retry_count, limit = self.retry_limit, "retry limit reached");
            return RetryDecision::DoNotRetry;
        }
        if !self.is_retryable(error) {
            return RetryDecision::DoNotRetry;
        }
        let delay = self.delay_for_attempt(retry_count);
        warn!(
            "Transient error (attempt {}/{}), retrying in {:.1}s: {error}",
            retry_count + 1,
            self.retry_limit,
            delay.as_secs_f64()
        );
        RetryDecision::RetryWithDelay(delay)
    }
}

impl RequestRetrier for RetryPolicy {
    fn retry<'a>(&'a self, request: &'a Request, error: &'a Error) -> RetryFuture<'a> {
        let decision = self.decide(request.retry_count(), error);
        Box::pin(async move { decision })
    }
}
