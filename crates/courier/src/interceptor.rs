//! Request adaptation and retry chains.
//!
//! A [`RequestAdapter`] rewrites a [`UrlRequest`] before it reaches the
//! transport (auth headers, base URLs, signing). A [`RequestRetrier`] decides
//! what happens after a failed attempt. An [`Interceptor`] composes ordered
//! lists of both and implements both traits itself, so interceptors nest.
//!
//! Both traits return boxed futures so they stay dyn-compatible; the
//! [`FnAdapter`] and [`FnRetrier`] wrappers cover the synchronous case.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::error::{Error, Result};
use crate::request::Request;
use crate::url_request::UrlRequest;

/// Boxed future returned by [`RequestAdapter::adapt`].
pub type AdaptFuture<'a> = Pin<Box<dyn Future<Output = Result<UrlRequest>> + Send + 'a>>;

/// Boxed future returned by [`RequestRetrier::retry`].
pub type RetryFuture<'a> = Pin<Box<dyn Future<Output = RetryDecision> + Send + 'a>>;

/// Outcome of a retry consultation.
#[derive(Debug, Clone)]
pub enum RetryDecision {
    /// Restart the request immediately.
    Retry,
    /// Restart the request after the delay.
    RetryWithDelay(Duration),
    /// Let the original error through.
    DoNotRetry,
    /// Stop retrying and report this error alongside the original.
    DoNotRetryWithError(Error),
}

impl RetryDecision {
    pub fn retry_required(&self) -> bool {
        matches!(self, RetryDecision::Retry | RetryDecision::RetryWithDelay(_))
    }

    /// The delay to wait before restarting, if this decision retries.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            RetryDecision::Retry => Some(Duration::ZERO),
            RetryDecision::RetryWithDelay(delay) => Some(*delay),
            _ => None,
        }
    }
}

// ── Traits ─────────────────────────────────────────────────────────

/// Rewrites a request before it is handed to the transport.
pub trait RequestAdapter: Send + Sync {
    fn adapt(&self, request: UrlRequest) -> AdaptFuture<'_>;
}

/// Decides whether a failed request should be retried.
///
/// `request.retry_count()` reports how many retries already happened.
pub trait RequestRetrier: Send + Sync {
    fn retry<'a>(&'a self, request: &'a Request, error: &'a Error) -> RetryFuture<'a>;
}

/// Anything that both adapts and retries.
pub trait RequestInterceptor: RequestAdapter + RequestRetrier {}

impl<T: RequestAdapter + RequestRetrier> RequestInterceptor for T {}

// ── Closure wrappers ───────────────────────────────────────────────

/// Adapter backed by a synchronous closure.
pub struct FnAdapter<F>(pub F);

impl<F> RequestAdapter for FnAdapter<F>
where
    F: Fn(UrlRequest) -> Result<UrlRequest> + Send + Sync,
{
    fn adapt(&self, request: UrlRequest) -> AdaptFuture<'_> {
        let result = (self.0)(request);
        Box::pin(async move { result })
    }
}

/// Retrier backed by a synchronous closure.
pub struct FnRetrier<F>(pub F);

impl<F> RequestRetrier for FnRetrier<F>
where
    F: Fn(&Request, &Error) -> RetryDecision + Send + Sync,
{
    fn retry<'a>(&'a self, request: &'a Request, error: &'a Error) -> RetryFuture<'a> {
        let decision = (self.0)(request, error);
        Box::pin(async move { decision })
    }
}

// ── Interceptor ────────────────────────────────────────────────────

/// Ordered adapters and retriers, immutable once built.
#[derive(Clone, Default)]
pub struct Interceptor {
    adapters: Vec<Arc<dyn RequestAdapter>>,
    retriers: Vec<Arc<dyn RequestRetrier>>,
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("adapters", &self.adapters.len())
            .field("retriers", &self.retriers.len())
            .finish()
    }
}

impl Interceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(mut self, adapter: impl RequestAdapter + 'static) -> Self {
        self.adapters.push(Arc::new(adapter));
        self
    }

    pub fn with_retrier(mut self, retrier: impl RequestRetrier + 'static) -> Self {
        self.retriers.push(Arc::new(retrier));
        self
    }

    /// Add something that both adapts and retries, e.g. a nested interceptor.
    pub fn with_interceptor<I: RequestInterceptor + 'static>(mut self, interceptor: I) -> Self {
        let shared = Arc::new(interceptor);
        self.adapters.push(shared.clone());
        self.retriers.push(shared);
        self
    }

    pub fn adapter_count(&self) -> usize {
        self.adapters.len()
    }

    pub fn retrier_count(&self) -> usize {
        self.retriers.len()
    }
}

impl RequestAdapter for Interceptor {
    fn adapt(&self, request: UrlRequest) -> AdaptFuture<'_> {
        Box::pin(async move {
            let mut request = request;
            for adapter in &self.adapters {
                request = adapter.adapt(request).await?;
            }
            Ok(request)
        })
    }
}

impl RequestRetrier for Interceptor {
    fn retry<'a>(&'a self, request: &'a Request, error: &'a Error) -> RetryFuture<'a> {
        Box::pin(async move {
            for (index, retrier) in self.retriers.iter().enumerate() {
                let decision = retrier.retry(request, error).await;
                if !matches!(decision, RetryDecision::DoNotRetry) {
                    trace!(retrier = index, ?decision, "retrier decided");
                    return decision;
                }
            }
            RetryDecision::DoNotRetry
        })
    }
}
