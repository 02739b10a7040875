//! A single call through a [`Session`](crate::Session): identity, lifecycle
//! state and the response collected so far.
//!
//! A [`Request`] moves through `Created → Running → {Finished, Cancelled}`
//! exactly once. Transport callbacks are tagged with the attempt that
//! produced them; callbacks from a superseded attempt are ignored.

use std::fmt;
use std::fs::File;
use std::future::Future;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::watch;
use uuid::Uuid;

use crate::delivery::DeliveryQueue;
use crate::error::{Error, ResponseSerializationFailure, Result};
use crate::interceptor::RequestInterceptor;
use crate::monitor::{EventMonitor, RequestEvent};
use crate::multipart::MultipartFormData;
use crate::response::{
    DataResponse, DataResponseSerializer, DecodableResponseSerializer, DownloadResponse,
    JsonResponseSerializer, ResponseMetadata, ResponseSerializer, StringResponseSerializer,
    TaskMetrics, Validation,
};
use crate::transport::TaskHandle;
use crate::url_request::UrlRequest;

/// Unique identifier of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Lifecycle phase of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Running,
    Finished,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Finished | Phase::Cancelled)
    }
}

/// Body of an upload request.
#[derive(Debug, Clone, PartialEq)]
pub enum Uploadable {
    Data(Bytes),
    File(PathBuf),
    Multipart(MultipartFormData),
}

// ── State ──────────────────────────────────────────────────────────

struct State {
    destination: Option<PathBuf>,
    phase: Phase,
    /// Held by the caller; orthogonal to `phase`.
    suspended: bool,
    /// A `Resumed` event has been sent.
    announced: bool,
    attempt: u64,
    task: Option<Arc<dyn TaskHandle>>,
    original: Option<UrlRequest>,
    adapted: Option<UrlRequest>,
    response: Option<ResponseMetadata>,
    buffer: BytesMut,
    data: Option<Bytes>,
    file: Option<BufWriter<File>>,
    file_created: bool,
    write_error: Option<Error>,
    error: Option<Error>,
    retry_count: u32,
    started: Option<Instant>,
    ended: Option<Instant>,
}

impl State {
    fn new(destination: Option<PathBuf>) -> Self {
        Self {
            destination,
            phase: Phase::Created,
            suspended: false,
            announced: false,
            attempt: 0,
            task: None,
            original: None,
            adapted: None,
            response: None,
            buffer: BytesMut::new(),
            data: None,
            file: None,
            file_created: false,
            write_error: None,
            error: None,
            retry_count: 0,
            started: None,
            ended: None,
        }
    }

    fn accepts(&self, attempt: u64) -> bool {
        !self.phase.is_terminal() && self.attempt == attempt
    }

    /// Freeze what this attempt received so far.
    fn freeze(&mut self) {
        if self.data.is_none() && (self.response.is_some() || !self.buffer.is_empty()) {
            self.data = Some(self.buffer.split().freeze());
        }
    }

    fn close_file(&mut self) {
        if let Some(mut file) = self.file.take()
            && let Err(e) = file.flush()
            && self.write_error.is_none()
        {
            self.write_error = Some(Error::DownloadWriteFailed {
                path: self.destination.clone().unwrap_or_default(),
                reason: e.to_string(),
            });
        }
    }

    fn terminate(&mut self, phase: Phase, error: Option<Error>) {
        self.phase = phase;
        self.error = error;
        self.ended = Some(Instant::now());
        self.freeze();
        self.close_file();
        self.task = None;
    }

    fn metrics(&self) -> Option<TaskMetrics> {
        let started = self.started?;
        let ended = self.ended.unwrap_or_else(Instant::now);
        Some(TaskMetrics {
            task_interval: ended.saturating_duration_since(started),
            retry_count: self.retry_count,
        })
    }
}

/// Everything a serializer or validator needs from a finished attempt.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub(crate) request: Option<UrlRequest>,
    pub(crate) response: Option<ResponseMetadata>,
    pub(crate) data: Option<Bytes>,
    pub(crate) error: Option<Error>,
    pub(crate) metrics: Option<TaskMetrics>,
    pub(crate) file_url: Option<PathBuf>,
}

/// Outcome of [`Request::attach_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attached {
    /// Cancelled or superseded; the caller cancels the task.
    Rejected,
    /// Attached but left suspended because the caller suspended the request.
    Held,
    /// Attached and resumed. `announce` is set for the first start only.
    Started { announce: bool },
}

/// Construction parameters supplied by the session.
pub(crate) struct RequestOptions {
    pub(crate) monitors: Arc<[Arc<dyn EventMonitor>]>,
    pub(crate) interceptor: Option<Arc<dyn RequestInterceptor>>,
    pub(crate) validators: Vec<Validation>,
    pub(crate) delivery: DeliveryQueue,
    pub(crate) runtime: Option<Handle>,
    pub(crate) destination: Option<PathBuf>,
}

struct RequestInner {
    id: RequestId,
    monitors: Arc<[Arc<dyn EventMonitor>]>,
    interceptor: Option<Arc<dyn RequestInterceptor>>,
    validators: Vec<Validation>,
    delivery: DeliveryQueue,
    runtime: Option<Handle>,
    destination: Option<PathBuf>,
    state: Mutex<State>,
    done: watch::Sender<bool>,
}

// ── Request ────────────────────────────────────────────────────────

/// Shared handle to one call. Cloning is cheap; clones observe the same state.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Request")
            .field("id", &self.inner.id)
            .field("phase", &state.phase)
            .field("retry_count", &state.retry_count)
            .finish()
    }
}

impl Request {
    pub(crate) fn new(options: RequestOptions) -> Self {
        let (done, _) = watch::channel(false);
        let state = State::new(options.destination.clone());
        Self {
            inner: Arc::new(RequestInner {
                id: RequestId::new(),
                monitors: options.monitors,
                interceptor: options.interceptor,
                validators: options.validators,
                delivery: options.delivery,
                runtime: options.runtime,
                destination: options.destination,
                state: Mutex::new(state),
                done,
            }),
        }
    }

    /// A request with no session, monitors or runtime.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::new(RequestOptions {
            monitors: Arc::from(Vec::new()),
            interceptor: None,
            validators: Vec::new(),
            delivery: DeliveryQueue::Inline,
            runtime: None,
            destination: None,
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase() == Phase::Finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.phase() == Phase::Cancelled
    }

    /// Whether the request reached either terminal phase.
    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    /// How many times the request has been retried.
    pub fn retry_count(&self) -> u32 {
        self.state().retry_count
    }

    /// The request before adaptation.
    pub fn request(&self) -> Option<UrlRequest> {
        self.state().original.clone()
    }

    /// The request as handed to the transport.
    pub fn adapted_request(&self) -> Option<UrlRequest> {
        self.state().adapted.clone()
    }

    pub fn response(&self) -> Option<ResponseMetadata> {
        self.state().response.clone()
    }

    pub fn error(&self) -> Option<Error> {
        self.state().error.clone()
    }

    /// Cancel the request. Only the first call has an effect.
    pub fn cancel(&self) {
        let task = {
            let mut state = self.state();
            if state.phase.is_terminal() {
                return;
            }
            let task = state.task.clone();
            state.terminate(Phase::Cancelled, Some(Error::ExplicitlyCancelled));
            task
        };
        if let Some(task) = task {
            task.cancel();
        }
        self.notify(&RequestEvent::Cancelled);
        self.inner.done.send_replace(true);
    }

    /// Whether the caller currently holds the request suspended.
    pub fn is_suspended(&self) -> bool {
        self.state().suspended
    }

    /// Pause the request. A task created later starts out held. Never
    /// changes the phase; no-op when already suspended or terminal.
    pub fn suspend(&self) {
        {
            let mut state = self.state();
            if state.phase.is_terminal() || state.suspended {
                return;
            }
            state.suspended = true;
            if let Some(task) = &state.task {
                task.suspend();
            }
        }
        self.notify(&RequestEvent::Suspended);
    }

    /// Undo [`suspend`](Self::suspend). No-op unless suspended.
    pub fn resume(&self) {
        {
            let mut state = self.state();
            if state.phase.is_terminal() || !state.suspended {
                return;
            }
            state.suspended = false;
            state.announced = true;
            if let Some(task) = &state.task {
                task.resume();
            }
        }
        self.notify(&RequestEvent::Resumed);
    }

    /// Wait for the terminal transition.
    pub async fn finished(&self) {
        let mut rx = self.inner.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    // ── Pipeline hooks ─────────────────────────────────────────────

    pub(crate) fn interceptor(&self) -> Option<Arc<dyn RequestInterceptor>> {
        self.inner.interceptor.clone()
    }

    pub(crate) fn notify(&self, event: &RequestEvent<'_>) {
        for monitor in self.inner.monitors.iter() {
            monitor.on_event(self, event);
        }
    }

    pub(crate) fn set_original(&self, request: UrlRequest) {
        self.state().original = Some(request);
    }

    pub(crate) fn original(&self) -> Option<UrlRequest> {
        self.request()
    }

    pub(crate) fn set_adapted(&self, request: UrlRequest) {
        self.state().adapted = Some(request);
    }

    pub(crate) fn attempt(&self) -> u64 {
        self.state().attempt
    }

    pub(crate) fn is_current(&self, attempt: u64) -> bool {
        self.state().accepts(attempt)
    }

    /// Attach the transport task for `attempt` and resume it unless the
    /// request is suspended. The task is resumed under the state lock so a
    /// concurrent [`suspend`](Self::suspend) cannot be overtaken.
    pub(crate) fn attach_task(&self, attempt: u64, task: Arc<dyn TaskHandle>) -> Attached {
        let mut state = self.state();
        if !state.accepts(attempt) {
            return Attached::Rejected;
        }
        state.phase = Phase::Running;
        state.started.get_or_insert_with(Instant::now);
        let attached = if state.suspended {
            Attached::Held
        } else {
            task.resume();
            let announce = !state.announced;
            state.announced = true;
            Attached::Started { announce }
        };
        state.task = Some(task);
        attached
    }

    pub(crate) fn did_receive_response(&self, attempt: u64, response: ResponseMetadata) {
        {
            let mut state = self.state();
            if !state.accepts(attempt) {
                return;
            }
            if let Some(path) = &self.inner.destination {
                match create_file(path) {
                    Ok(file) => {
                        state.file = Some(file);
                        state.file_created = true;
                    }
                    Err(e) => state.write_error = Some(e),
                }
            }
            state.response = Some(response.clone());
        }
        self.notify(&RequestEvent::ResponseReceived(&response));
    }

    pub(crate) fn did_receive_data(&self, attempt: u64, data: &[u8]) {
        {
            let mut state = self.state();
            if !state.accepts(attempt) {
                return;
            }
            let state = &mut *state;
            match state.file.as_mut() {
                Some(file) => {
                    if let Err(e) = file.write_all(data)
                        && state.write_error.is_none()
                    {
                        state.write_error = Some(Error::DownloadWriteFailed {
                            path: state.destination.clone().unwrap_or_default(),
                            reason: e.to_string(),
                        });
                    }
                }
                None => state.buffer.extend_from_slice(data),
            }
        }
        self.notify(&RequestEvent::DataReceived(data));
    }

    /// Close the current attempt: freeze its data, flush any download, and
    /// return the write error (if any) plus what validation needs.
    pub(crate) fn close_attempt(&self, attempt: u64) -> Option<(Option<Error>, Snapshot)> {
        let mut state = self.state();
        if !state.accepts(attempt) {
            return None;
        }
        state.freeze();
        state.close_file();
        let write_error = state.write_error.take();
        Some((write_error, self.snapshot_locked(&state)))
    }

    /// Run the validators attached at build time against a closed attempt.
    /// Downloads are validated against the contents of their file.
    pub(crate) async fn validate(&self, snapshot: &Snapshot) -> Result<()> {
        let Some(response) = &snapshot.response else {
            return Ok(());
        };
        if self.inner.validators.is_empty() {
            return Ok(());
        }
        let data = match (&snapshot.file_url, &snapshot.data) {
            (None, data) => data.clone(),
            (Some(path), _) => match tokio::fs::read(path).await {
                Ok(contents) => Some(Bytes::from(contents)),
                Err(e) => {
                    return Err(Error::ResponseSerializationFailed(
                        ResponseSerializationFailure::InputFileReadFailed {
                            path: path.clone(),
                            reason: e.to_string(),
                        },
                    ));
                }
            },
        };
        for validation in &self.inner.validators {
            validation.validate(snapshot.request.as_ref(), response, data.as_deref())?;
        }
        Ok(())
    }

    /// Reset per-attempt state for a retry. Returns the new retry count and
    /// attempt, or `None` when the request is already terminal.
    pub(crate) fn prepare_retry(&self) -> Option<(u32, u64)> {
        let mut state = self.state();
        if state.phase.is_terminal() {
            return None;
        }
        state.retry_count += 1;
        state.attempt += 1;
        state.task = None;
        state.response = None;
        state.buffer.clear();
        state.data = None;
        state.file = None;
        Some((state.retry_count, state.attempt))
    }

    /// Terminal transition to `Finished`. Monitors and waiters are told by
    /// [`notify_completion`](Self::notify_completion).
    pub(crate) fn transition_to_finished(&self, error: Option<Error>) -> bool {
        let mut state = self.state();
        if state.phase.is_terminal() {
            return false;
        }
        state.terminate(Phase::Finished, error);
        true
    }

    pub(crate) fn notify_completion(&self) {
        if let Some(error) = self.error() {
            self.notify(&RequestEvent::Failed(&error));
        }
        self.notify(&RequestEvent::Finished);
        self.inner.done.send_replace(true);
    }

    /// Finish outside the registry (failures before a task exists).
    pub(crate) fn finish(&self, error: Option<Error>) {
        if self.transition_to_finished(error) {
            self.notify_completion();
        }
    }

    fn snapshot_locked(&self, state: &State) -> Snapshot {
        Snapshot {
            request: state.adapted.clone().or_else(|| state.original.clone()),
            response: state.response.clone(),
            data: state.data.clone(),
            error: state.error.clone(),
            metrics: state.metrics(),
            file_url: state
                .file_created
                .then(|| self.inner.destination.clone())
                .flatten(),
        }
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        let state = self.state();
        self.snapshot_locked(&state)
    }

    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.inner.runtime {
            Some(handle) => {
                handle.spawn(future);
            }
            None => {
                tokio::spawn(future);
            }
        }
    }
}

fn create_file(path: &Path) -> Result<BufWriter<File>> {
    let fail = |e: std::io::Error| Error::DownloadWriteFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(fail)?;
    }
    File::create(path).map(BufWriter::new).map_err(fail)
}

// ── Data requests ──────────────────────────────────────────────────

/// Handle for data and upload requests.
#[derive(Debug, Clone)]
pub struct DataRequest(pub(crate) Request);

impl std::ops::Deref for DataRequest {
    type Target = Request;

    fn deref(&self) -> &Request {
        &self.0
    }
}

impl DataRequest {
    /// Wait for completion and return the raw body.
    pub async fn response(&self) -> DataResponse<Option<Bytes>> {
        self.0.finished().await;
        let snapshot = self.0.snapshot();
        let start = Instant::now();
        let result = match snapshot.error {
            Some(error) => Err(error),
            None => Ok(snapshot.data.clone()),
        };
        DataResponse {
            request: snapshot.request,
            response: snapshot.response,
            data: snapshot.data,
            metrics: snapshot.metrics,
            serialization_duration: start.elapsed(),
            result,
        }
    }

    /// Wait for completion and serialize with `serializer`.
    pub async fn response_with<S: ResponseSerializer>(
        &self,
        serializer: S,
    ) -> DataResponse<S::Output> {
        self.0.finished().await;
        let snapshot = self.0.snapshot();
        let start = Instant::now();
        let result = serializer.serialize(
            snapshot.request.as_ref(),
            snapshot.response.as_ref(),
            snapshot.data.as_ref(),
            snapshot.error.as_ref(),
        );
        DataResponse {
            request: snapshot.request,
            response: snapshot.response,
            data: snapshot.data,
            metrics: snapshot.metrics,
            serialization_duration: start.elapsed(),
            result,
        }
    }

    pub async fn response_data(&self) -> DataResponse<Bytes> {
        self.response_with(DataResponseSerializer::default()).await
    }

    pub async fn response_string(&self) -> DataResponse<String> {
        self.response_with(StringResponseSerializer::default()).await
    }

    pub async fn response_json(&self) -> DataResponse<Value> {
        self.response_with(JsonResponseSerializer::default()).await
    }

    pub async fn response_decodable<T>(&self) -> DataResponse<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.response_with(DecodableResponseSerializer::<T>::default())
            .await
    }

    /// Serialize on completion and hand the envelope to `handler` on the
    /// request's delivery queue.
    pub fn on_response<S, F>(&self, serializer: S, handler: F) -> &Self
    where
        S: ResponseSerializer,
        F: FnOnce(DataResponse<S::Output>) + Send + 'static,
    {
        let this = self.clone();
        let queue = self.0.inner.delivery.clone();
        self.0.spawn(async move {
            let response = this.response_with(serializer).await;
            queue.deliver(move || handler(response));
        });
        self
    }

    pub fn on_response_data<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(DataResponse<Bytes>) + Send + 'static,
    {
        self.on_response(DataResponseSerializer::default(), handler)
    }

    pub fn on_response_string<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(DataResponse<String>) + Send + 'static,
    {
        self.on_response(StringResponseSerializer::default(), handler)
    }

    pub fn on_response_json<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(DataResponse<Value>) + Send + 'static,
    {
        self.on_response(JsonResponseSerializer::default(), handler)
    }

    pub fn on_response_decodable<T, F>(&self, handler: F) -> &Self
    where
        T: DeserializeOwned + Send + 'static,
        F: FnOnce(DataResponse<T>) + Send + 'static,
    {
        self.on_response(DecodableResponseSerializer::<T>::default(), handler)
    }
}

// ── Download requests ──────────────────────────────────────────────

/// Handle for download requests; the body is written to a file.
#[derive(Debug, Clone)]
pub struct DownloadRequest(pub(crate) Request);

impl std::ops::Deref for DownloadRequest {
    type Target = Request;

    fn deref(&self) -> &Request {
        &self.0
    }
}

impl DownloadRequest {
    /// Where the body is (or will be) written.
    pub fn destination(&self) -> Option<&Path> {
        self.0.inner.destination.as_deref()
    }

    /// Wait for completion; the value is the file location, if one was written.
    pub async fn response(&self) -> DownloadResponse<Option<PathBuf>> {
        self.0.finished().await;
        let snapshot = self.0.snapshot();
        let start = Instant::now();
        let result = match snapshot.error {
            Some(error) => Err(error),
            None => Ok(snapshot.file_url.clone()),
        };
        DownloadResponse {
            request: snapshot.request,
            response: snapshot.response,
            file_url: snapshot.file_url,
            metrics: snapshot.metrics,
            serialization_duration: start.elapsed(),
            result,
        }
    }

    /// The downloaded file's location, failing when none was written.
    pub async fn response_url(&self) -> DownloadResponse<PathBuf> {
        let response = self.response().await;
        let result = response.result.and_then(|url| {
            url.ok_or(Error::ResponseSerializationFailed(
                ResponseSerializationFailure::InputFileNil,
            ))
        });
        DownloadResponse {
            request: response.request,
            response: response.response,
            file_url: response.file_url,
            metrics: response.metrics,
            serialization_duration: response.serialization_duration,
            result,
        }
    }

    /// Wait for completion, read the file and serialize it with `serializer`.
    pub async fn response_with<S: ResponseSerializer>(
        &self,
        serializer: S,
    ) -> DownloadResponse<S::Output> {
        self.0.finished().await;
        let snapshot = self.0.snapshot();
        let start = Instant::now();
        let result = serializer.serialize_download(
            snapshot.request.as_ref(),
            snapshot.response.as_ref(),
            snapshot.file_url.as_deref(),
            snapshot.error.as_ref(),
        );
        DownloadResponse {
            request: snapshot.request,
            response: snapshot.response,
            file_url: snapshot.file_url,
            metrics: snapshot.metrics,
            serialization_duration: start.elapsed(),
            result,
        }
    }

    pub async fn response_data(&self) -> DownloadResponse<Bytes> {
        self.response_with(DataResponseSerializer::default()).await
    }

    pub fn on_response<S, F>(&self, serializer: S, handler: F) -> &Self
    where
        S: ResponseSerializer,
        F: FnOnce(DownloadResponse<S::Output>) + Send + 'static,
    {
        let this = self.clone();
        let queue = self.0.inner.delivery.clone();
        self.0.spawn(async move {
            let response = this.response_with(serializer).await;
            queue.deliver(move || handler(response));
        });
        self
    }

    pub fn on_response_url<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(DownloadResponse<PathBuf>) + Send + 'static,
    {
        let this = self.clone();
        let queue = self.0.inner.delivery.clone();
        self.0.spawn(async move {
            let response = this.response_url().await;
            queue.deliver(move || handler(response));
        });
        self
    }

    pub fn on_response_data<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(DownloadResponse<Bytes>) + Send + 'static,
    {
        self.on_response(DataResponseSerializer::default(), handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::FnMonitor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    fn counting(counter: Arc<AtomicUsize>) -> Arc<dyn EventMonitor> {
        Arc::new(FnMonitor::new(move |_: &Request, event: &RequestEvent<'_>| {
            if matches!(event, RequestEvent::Cancelled) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }))
    }

    fn with_monitor(monitor: Arc<dyn EventMonitor>) -> Request {
        Request::new(RequestOptions {
            monitors: Arc::from(vec![monitor]),
            interceptor: None,
            validators: Vec::new(),
            delivery: DeliveryQueue::Inline,
            runtime: None,
            destination: None,
        })
    }

    fn meta(status: u16) -> ResponseMetadata {
        ResponseMetadata::new(
            Url::parse("https://example.com/").unwrap(),
            status,
            Default::default(),
        )
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let request = with_monitor(counting(cancels.clone()));

        request.cancel();
        request.cancel();
        request.cancel();

        assert!(request.is_cancelled());
        assert!(!request.is_finished());
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert!(request.error().unwrap().is_explicitly_cancelled());
        request.finished().await;
    }

    #[test]
    fn suspend_and_resume_only_report_real_changes() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let request = with_monitor(Arc::new(FnMonitor::new(
            move |_: &Request, event: &RequestEvent<'_>| {
                sink.lock().unwrap().push(format!("{event:?}"));
            },
        )));

        request.resume();
        request.suspend();
        request.suspend();
        assert!(request.is_suspended());
        request.resume();
        request.resume();

        assert_eq!(request.phase(), Phase::Created);
        assert_eq!(*events.lock().unwrap(), vec!["Suspended", "Resumed"]);
    }

    #[tokio::test]
    async fn finish_after_cancel_is_ignored() {
        let request = Request::detached();
        request.cancel();
        assert!(!request.transition_to_finished(None));
        assert!(request.is_cancelled());
    }

    #[test]
    fn callbacks_require_current_attempt() {
        let request = Request::detached();
        request.did_receive_response(0, meta(200));
        request.did_receive_data(0, b"first");

        let (retry_count, attempt) = request.prepare_retry().unwrap();
        assert_eq!((retry_count, attempt), (1, 1));
        assert!(request.response().is_none());

        request.did_receive_data(0, b"stale");
        request.did_receive_response(1, meta(201));
        request.did_receive_data(1, b"second");

        let (write_error, snapshot) = request.close_attempt(1).unwrap();
        assert!(write_error.is_none());
        assert_eq!(snapshot.data.as_deref(), Some(&b"second"[..]));
        assert_eq!(snapshot.response.unwrap().status, 201);
        assert!(request.close_attempt(0).is_none());
    }

    #[tokio::test]
    async fn cancelled_request_keeps_buffered_bytes() {
        let request = DataRequest(Request::detached());
        request.0.did_receive_response(0, meta(200));
        request.0.did_receive_data(0, b"partial");
        request.cancel();

        let response = request.response().await;
        assert_eq!(response.data.as_deref(), Some(&b"partial"[..]));
        assert!(response.error().unwrap().is_explicitly_cancelled());
    }

    #[tokio::test]
    async fn download_writes_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.bin");
        let request = DownloadRequest(Request::new(RequestOptions {
            monitors: Arc::from(Vec::new()),
            interceptor: None,
            validators: Vec::new(),
            delivery: DeliveryQueue::Inline,
            runtime: None,
            destination: Some(path.clone()),
        }));
        request.0.did_receive_response(0, meta(200));
        request.0.did_receive_data(0, b"abc");
        request.0.did_receive_data(0, b"def");
        let (write_error, _) = request.0.close_attempt(0).unwrap();
        assert!(write_error.is_none());
        request.0.finish(None);

        let response = request.response_data().await;
        assert_eq!(response.file_url.as_deref(), Some(path.as_path()));
        assert_eq!(response.value().map(|b| &b[..]), Some(&b"abcdef"[..]));
    }
}
