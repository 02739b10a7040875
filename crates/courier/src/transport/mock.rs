//! Scripted in-process transport for lifecycle tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::watch;
use url::Url;

use super::{TaskDelegate, TaskHandle, TaskKind, Transport};
use crate::error::{TransportError, TransportErrorKind};
use crate::headers::HttpHeaders;
use crate::response::ResponseMetadata;
use crate::url_request::UrlRequest;

/// What a scripted task does once resumed.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Respond {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        chunks: Vec<Bytes>,
    },
    Fail(TransportError),
    /// Never completes until cancelled.
    Hang,
}

impl Reply {
    pub(crate) fn ok(body: &'static str) -> Self {
        Self::status(200, body)
    }

    pub(crate) fn status(status: u16, body: &'static str) -> Self {
        Reply::Respond {
            status,
            headers: vec![("Content-Type", "text/plain; charset=utf-8")],
            chunks: if body.is_empty() {
                Vec::new()
            } else {
                vec![Bytes::from_static(body.as_bytes())]
            },
        }
    }

    pub(crate) fn fail(kind: TransportErrorKind) -> Self {
        Reply::Fail(TransportError::new(kind, "scripted failure"))
    }
}

/// A control call a scripted task received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskCall {
    Resume,
    Suspend,
    Cancel,
}

pub(crate) struct MockTransport {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    gate: watch::Sender<bool>,
    next_id: AtomicU64,
    created: AtomicUsize,
    kinds: Mutex<Vec<TaskKind>>,
    requests: Mutex<Vec<UrlRequest>>,
    calls: Arc<Mutex<Vec<TaskCall>>>,
}

impl MockTransport {
    /// Every task gets `fallback`.
    pub(crate) fn new(fallback: Reply) -> Arc<Self> {
        Self::scripted(Vec::new(), fallback)
    }

    /// Tasks take `replies` in order, then `fallback`.
    pub(crate) fn scripted(replies: Vec<Reply>, fallback: Reply) -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            fallback,
            gate,
            next_id: AtomicU64::new(1),
            created: AtomicUsize::new(0),
            kinds: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            calls: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Hold every resumed task until [`open_gate`](Self::open_gate).
    pub(crate) fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub(crate) fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<UrlRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn kinds(&self) -> Vec<TaskKind> {
        self.kinds.lock().unwrap().clone()
    }

    /// Control calls received by every task, in order.
    pub(crate) fn calls(&self) -> Vec<TaskCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    fn create_task(
        &self,
        kind: TaskKind,
        request: &UrlRequest,
        delegate: Arc<dyn TaskDelegate>,
    ) -> Result<Arc<dyn TaskHandle>, TransportError> {
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        self.kinds.lock().unwrap().push(kind);
        self.requests.lock().unwrap().push(request.clone());

        let (cancel, _) = watch::channel(false);
        let (running, _) = watch::channel(false);
        Ok(Arc::new(MockTask {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            url: request.url.clone(),
            reply: Mutex::new(Some(reply)),
            delegate,
            gate: self.gate.subscribe(),
            cancel,
            running,
            calls: self.calls.clone(),
        }))
    }
}

struct MockTask {
    id: u64,
    url: Url,
    reply: Mutex<Option<Reply>>,
    delegate: Arc<dyn TaskDelegate>,
    gate: watch::Receiver<bool>,
    cancel: watch::Sender<bool>,
    /// `false` while suspended; delivery waits on it between steps.
    running: watch::Sender<bool>,
    calls: Arc<Mutex<Vec<TaskCall>>>,
}

impl TaskHandle for MockTask {
    fn id(&self) -> u64 {
        self.id
    }

    fn resume(&self) {
        self.calls.lock().unwrap().push(TaskCall::Resume);
        self.running.send_replace(true);
        let Some(reply) = self.reply.lock().unwrap().take() else {
            return;
        };
        tokio::spawn(deliver(
            reply,
            self.url.clone(),
            self.delegate.clone(),
            Signals {
                gate: self.gate.clone(),
                running: self.running.subscribe(),
                cancel: self.cancel.subscribe(),
            },
        ));
    }

    fn suspend(&self) {
        self.calls.lock().unwrap().push(TaskCall::Suspend);
        self.running.send_replace(false);
    }

    fn cancel(&self) {
        self.calls.lock().unwrap().push(TaskCall::Cancel);
        self.cancel.send_replace(true);
        if self.reply.lock().unwrap().take().is_some() {
            let delegate = self.delegate.clone();
            tokio::spawn(async move {
                delegate.did_complete(Some(TransportError::cancelled()));
            });
        }
    }
}

struct Signals {
    gate: watch::Receiver<bool>,
    running: watch::Receiver<bool>,
    cancel: watch::Receiver<bool>,
}

impl Signals {
    /// Wait until the gate is open and the task is not suspended. `false`
    /// means the task was cancelled first.
    async fn proceed(&mut self) -> bool {
        let Signals {
            gate,
            running,
            cancel,
        } = self;
        let ready = async {
            let _ = gate.wait_for(|open| *open).await;
            let _ = running.wait_for(|running| *running).await;
        };
        tokio::select! {
            biased;
            _ = cancel.wait_for(|c| *c) => false,
            () = ready => true,
        }
    }
}

async fn deliver(reply: Reply, url: Url, delegate: Arc<dyn TaskDelegate>, mut signals: Signals) {
    if !signals.proceed().await {
        delegate.did_complete(Some(TransportError::cancelled()));
        return;
    }
    match reply {
        Reply::Respond {
            status,
            headers,
            chunks,
        } => {
            let headers: HttpHeaders = headers.into_iter().collect();
            delegate.did_receive_response(ResponseMetadata::new(url, status, headers));
            for chunk in chunks {
                if !signals.proceed().await {
                    delegate.did_complete(Some(TransportError::cancelled()));
                    return;
                }
                delegate.did_receive_data(chunk);
                tokio::task::yield_now().await;
            }
            if !signals.proceed().await {
                delegate.did_complete(Some(TransportError::cancelled()));
                return;
            }
            delegate.did_complete(None);
        }
        Reply::Fail(error) => delegate.did_complete(Some(error)),
        Reply::Hang => {
            let _ = signals.cancel.wait_for(|c| *c).await;
            delegate.did_complete(Some(TransportError::cancelled()));
        }
    }
}
