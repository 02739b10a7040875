//! Lifecycle events and the monitors that observe them.
//!
//! The session and each [`Request`] report their progress through
//! [`RequestEvent`] values. Monitors are attached to the session and see
//! every request it creates.
//!
//! | Monitor | Use case |
//! |---------|----------|
//! | [`LoggingMonitor`] | Structured logging via `tracing` |
//! | [`FnMonitor`] | Quick closures |
//! | [`CompositeMonitor`] | Compose several monitors in order |

use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::error::Error;
use crate::request::Request;
use crate::response::ResponseMetadata;

/// Events emitted over a request's lifetime.
#[derive(Debug)]
pub enum RequestEvent<'a> {
    /// The first task started, or the request was resumed after `suspend()`.
    Resumed,
    /// Emitted when `suspend()` actually pauses the request.
    Suspended,
    /// Emitted once, on the first `cancel()`.
    Cancelled,
    ResponseReceived(&'a ResponseMetadata),
    DataReceived(&'a [u8]),
    /// A retrier asked for another attempt.
    WillRetry { retry_count: u32, delay: Duration },
    /// The request reached its terminal state with an error.
    Failed(&'a Error),
    /// The request reached its terminal state. Follows `Failed` on error.
    Finished,
}

/// Observer of request events. The default implementation ignores them.
pub trait EventMonitor: Send + Sync {
    fn on_event(&self, request: &Request, event: &RequestEvent<'_>) {
        let _ = (request, event);
    }
}

/// Monitor backed by a closure.
pub struct FnMonitor<F>(F)
where
    F: Fn(&Request, &RequestEvent<'_>) + Send + Sync;

impl<F> FnMonitor<F>
where
    F: Fn(&Request, &RequestEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventMonitor for FnMonitor<F>
where
    F: Fn(&Request, &RequestEvent<'_>) + Send + Sync,
{
    fn on_event(&self, request: &Request, event: &RequestEvent<'_>) {
        (self.0)(request, event)
    }
}

/// Dispatches each event to every inner monitor, in registration order.
#[derive(Default)]
pub struct CompositeMonitor {
    monitors: Vec<Box<dyn EventMonitor>>,
}

impl CompositeMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, monitor: impl EventMonitor + 'static) -> Self {
        self.monitors.push(Box::new(monitor));
        self
    }

    /// Add a monitor only when `condition` holds.
    pub fn with_if(self, condition: bool, monitor: impl EventMonitor + 'static) -> Self {
        if condition { self.with(monitor) } else { self }
    }
}

impl EventMonitor for CompositeMonitor {
    fn on_event(&self, request: &Request, event: &RequestEvent<'_>) {
        for monitor in &self.monitors {
            monitor.on_event(request, event);
        }
    }
}

/// Logs every event through `tracing`.
pub struct LoggingMonitor;

impl EventMonitor for LoggingMonitor {
    fn on_event(&self, request: &Request, event: &RequestEvent<'_>) {
        let id = request.id();
        match event {
            RequestEvent::Resumed => debug!("[{id}] resumed"),
            RequestEvent::Suspended => debug!("[{id}] suspended"),
            RequestEvent::Cancelled => info!("[{id}] cancelled"),
            RequestEvent::ResponseReceived(response) => {
                debug!(
                    "[{id}] HTTP {} {}",
                    response.status,
                    response.content_type().unwrap_or("(no content type)")
                );
            }
            RequestEvent::DataReceived(data) => trace!("[{id}] {} bytes", data.len()),
            RequestEvent::WillRetry { retry_count, delay } => {
                warn!(
                    "[{id}] retry {retry_count} in {:.1}s",
                    delay.as_secs_f64()
                );
            }
            RequestEvent::Failed(error) => warn!("[{id}] failed: {error}"),
            RequestEvent::Finished => info!("[{id}] finished"),
        }
    }
}
