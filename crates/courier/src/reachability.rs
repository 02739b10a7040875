//! Network reachability monitoring.
//!
//! [`NetworkReachabilityManager`] probes a host with a TCP connect on an
//! interval and reports status changes to a listener. The request pipeline
//! never consults it; callers use it to decide when to retry or pause work.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// How long a probe waits for the connection.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// Time between probes while listening.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    EthernetOrWiFi,
    Cellular,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReachabilityStatus {
    /// No probe has completed yet.
    #[default]
    Unknown,
    NotReachable,
    Reachable(ConnectionType),
}

impl fmt::Display for ReachabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReachabilityStatus::Unknown => "unknown",
            ReachabilityStatus::NotReachable => "not reachable",
            ReachabilityStatus::Reachable(ConnectionType::EthernetOrWiFi) => {
                "reachable (ethernet or wifi)"
            }
            ReachabilityStatus::Reachable(ConnectionType::Cellular) => "reachable (cellular)",
        };
        f.write_str(label)
    }
}

/// Called with every status change while listening.
pub type Listener = Arc<dyn Fn(ReachabilityStatus) + Send + Sync>;

pub struct NetworkReachabilityManager {
    target: String,
    interval: Duration,
    timeout: Duration,
    status: Arc<watch::Sender<ReachabilityStatus>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for NetworkReachabilityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkReachabilityManager")
            .field("target", &self.target)
            .field("status", &self.status())
            .field("listening", &self.is_listening())
            .finish()
    }
}

impl NetworkReachabilityManager {
    /// Monitor `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let (status, _) = watch::channel(ReachabilityStatus::Unknown);
        Self {
            target: format!("{}:{port}", host.into()),
            interval: DEFAULT_PROBE_INTERVAL,
            timeout: DEFAULT_PROBE_TIMEOUT,
            status: Arc::new(status),
            task: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Last observed status.
    pub fn status(&self) -> ReachabilityStatus {
        *self.status.borrow()
    }

    pub fn is_reachable(&self) -> bool {
        matches!(self.status(), ReachabilityStatus::Reachable(_))
    }

    pub fn is_reachable_on_cellular(&self) -> bool {
        self.status() == ReachabilityStatus::Reachable(ConnectionType::Cellular)
    }

    pub fn is_reachable_on_ethernet_or_wifi(&self) -> bool {
        self.status() == ReachabilityStatus::Reachable(ConnectionType::EthernetOrWiFi)
    }

    /// Receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<ReachabilityStatus> {
        self.status.subscribe()
    }

    /// Probe once and record the result.
    pub async fn refresh(&self) -> ReachabilityStatus {
        let status = probe(&self.target, self.timeout).await;
        self.status.send_replace(status);
        status
    }

    /// Start probing on the current runtime. The listener gets the first
    /// result and every change after it. Replaces any previous listener.
    pub fn start_listening(
        &self,
        listener: impl Fn(ReachabilityStatus) + Send + Sync + 'static,
    ) -> Result<()> {
        let runtime = Handle::try_current().map_err(|e| {
            Error::SessionConfiguration(format!("reachability needs a tokio runtime: {e}"))
        })?;
        self.stop_listening();

        let listener: Listener = Arc::new(listener);
        let target = self.target.clone();
        let (interval, timeout) = (self.interval, self.timeout);
        let status = self.status.clone();
        debug!("reachability: listening on {target} every {interval:?}");

        let task = runtime.spawn(async move {
            let mut previous = None;
            loop {
                let current = probe(&target, timeout).await;
                if previous != Some(current) {
                    debug!("reachability: {target} is {current}");
                    status.send_replace(current);
                    listener(current);
                    previous = Some(current);
                }
                tokio::time::sleep(interval).await;
            }
        });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok(())
    }

    pub fn stop_listening(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }

    pub fn is_listening(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for NetworkReachabilityManager {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

// A plain TCP probe cannot tell the link type apart.
async fn probe(target: &str, timeout: Duration) -> ReachabilityStatus {
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(_)) => ReachabilityStatus::Reachable(ConnectionType::EthernetOrWiFi),
        Ok(Err(e)) => {
            trace!("reachability probe to {target} failed: {e}");
            ReachabilityStatus::NotReachable
        }
        Err(_) => {
            trace!("reachability probe to {target} timed out");
            ReachabilityStatus::NotReachable
        }
    }
}
