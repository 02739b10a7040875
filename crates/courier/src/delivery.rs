//! Where response handlers run.
//!
//! A [`DeliveryQueue`] decides the execution context of `on_response*`
//! handlers. [`MainQueue`] is the equivalent of a UI event loop: handlers are
//! queued until the owning thread drains them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::Notify;

type Job = Box<dyn FnOnce() + Send>;

/// Execution context for response handlers.
#[derive(Clone)]
pub enum DeliveryQueue {
    /// Spawn on a tokio runtime.
    Runtime(Handle),
    /// Queue until the owner drains the [`MainQueue`].
    Main(MainQueue),
    /// Run on whichever task produced the response.
    Inline,
}

impl fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryQueue::Runtime(_) => f.write_str("Runtime"),
            DeliveryQueue::Main(queue) => write!(f, "Main({} pending)", queue.len()),
            DeliveryQueue::Inline => f.write_str("Inline"),
        }
    }
}

impl DeliveryQueue {
    pub fn deliver(&self, job: impl FnOnce() + Send + 'static) {
        match self {
            DeliveryQueue::Runtime(handle) => {
                handle.spawn(async move { job() });
            }
            DeliveryQueue::Main(queue) => queue.push(Box::new(job)),
            DeliveryQueue::Inline => job(),
        }
    }
}

/// A FIFO of handlers drained by a single owner thread.
#[derive(Clone, Default)]
pub struct MainQueue {
    jobs: Arc<Mutex<VecDeque<Job>>>,
    ready: Arc<Notify>,
}

impl MainQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, job: Job) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.push_back(job);
        }
        self.ready.notify_one();
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().map_or(0, |jobs| jobs.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every queued handler on the calling thread. Returns how many ran.
    pub fn drain(&self) -> usize {
        let jobs: Vec<Job> = match self.jobs.lock() {
            Ok(mut jobs) => jobs.drain(..).collect(),
            Err(_) => return 0,
        };
        let count = jobs.len();
        for job in jobs {
            job();
        }
        count
    }

    /// Wait until at least one handler is queued, then drain.
    pub async fn drain_next(&self) -> usize {
        loop {
            let notified = self.ready.notified();
            let ran = self.drain();
            if ran > 0 {
                return ran;
            }
            notified.await;
        }
    }

    pub fn as_queue(&self) -> DeliveryQueue {
        DeliveryQueue::Main(self.clone())
    }
}
