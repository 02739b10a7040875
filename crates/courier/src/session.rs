//! Sessions: request builders, asynchronous dispatch and the registry of
//! in-flight requests.
//!
//! ```ignore
//! let session = Session::builder()
//!     .interceptor(Interceptor::new().with_retrier(RetryPolicy::default()))
//!     .monitor(LoggingMonitor)
//!     .build()?;
//!
//! let response = session
//!     .request("https://httpbin.org/get")
//!     .parameters(params)
//!     .validate()
//!     .send()
//!     .response_json()
//!     .await;
//! ```

use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::delivery::DeliveryQueue;
use crate::encoding::{ParameterEncoder, ParameterEncoding, Parameters, UrlEncoding};
use crate::error::{Error, Result, TransportError};
use crate::headers::{HttpHeader, HttpHeaders};
use crate::interceptor::{RequestInterceptor, RetryDecision};
use crate::method::HttpMethod;
use crate::monitor::{EventMonitor, RequestEvent};
use crate::request::{
    Attached, DataRequest, DownloadRequest, Request, RequestId, RequestOptions, Uploadable,
};
use crate::response::{ResponseMetadata, Validation};
use crate::transport::{ReqwestTransport, TaskDelegate, TaskKind, Transport, UploadBody};
use crate::url_request::{RequestConvertible, UrlConvertible, UrlRequest};

// ── Configuration ──────────────────────────────────────────────────

/// Session-wide defaults applied to every request.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Request timeout. `None` leaves it to the transport.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
    /// Added to every request that does not set the header itself.
    pub default_headers: HttpHeaders,
    /// Where `on_response*` handlers run. `None` uses the session runtime.
    pub delivery: Option<DeliveryQueue>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            user_agent: Some(concat!("courier/", env!("CARGO_PKG_VERSION")).to_string()),
            default_headers: HttpHeaders::new(),
            delivery: None,
        }
    }
}

impl SessionConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.add(name, value);
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryQueue) -> Self {
        self.delivery = Some(delivery);
        self
    }
}

/// Builder for [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    config: SessionConfig,
    transport: Option<Arc<dyn Transport>>,
    interceptor: Option<Arc<dyn RequestInterceptor>>,
    monitors: Vec<Arc<dyn EventMonitor>>,
    runtime: Option<Handle>,
}

impl SessionBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom transport instead of the default reqwest one.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Default interceptor for every request that does not set its own.
    pub fn interceptor(mut self, interceptor: impl RequestInterceptor + 'static) -> Self {
        self.interceptor = Some(Arc::new(interceptor));
        self
    }

    pub fn monitor(mut self, monitor: impl EventMonitor + 'static) -> Self {
        self.monitors.push(Arc::new(monitor));
        self
    }

    /// Runtime that dispatch and completion handling run on. Defaults to
    /// the runtime the builder is called from.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<Session> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|e| {
                Error::SessionConfiguration(format!(
                    "no tokio runtime available, pass one with SessionBuilder::runtime: {e}"
                ))
            })?,
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let delivery = self
            .config
            .delivery
            .clone()
            .unwrap_or_else(|| DeliveryQueue::Runtime(runtime.clone()));
        debug!(
            "session built: {} monitor(s), interceptor={}",
            self.monitors.len(),
            self.interceptor.is_some()
        );
        Ok(Session {
            inner: Arc::new(SessionInner {
                transport,
                interceptor: self.interceptor,
                monitors: self.monitors.into(),
                registry: Mutex::new(HashMap::new()),
                config: self.config,
                delivery,
                runtime,
            }),
        })
    }
}

// ── Session ────────────────────────────────────────────────────────

/// Creates, dispatches and tracks requests. Cloning shares the session.
///
/// Dropping the last clone cancels every request still in flight.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    transport: Arc<dyn Transport>,
    interceptor: Option<Arc<dyn RequestInterceptor>>,
    monitors: Arc<[Arc<dyn EventMonitor>]>,
    registry: Mutex<HashMap<RequestId, Request>>,
    config: SessionConfig,
    delivery: DeliveryQueue,
    runtime: Handle,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("active_requests", &self.active_request_count())
            .field("monitors", &self.inner.monitors.len())
            .finish()
    }
}

impl Session {
    /// Session with the default reqwest transport on the current runtime.
    ///
    /// Requests are cancelled when the last clone is dropped; for a session
    /// that lives as long as the process see [`Session::shared`].
    pub fn new() -> Result<Self> {
        SessionBuilder::default().build()
    }

    /// The process-wide session behind [`request`], [`download`] and
    /// [`upload`]. It owns a small runtime of its own, so it works from
    /// synchronous code and is never dropped.
    pub fn shared() -> Result<Session> {
        match &*SHARED {
            Ok(shared) => Ok(shared.session.clone()),
            Err(e) => Err(e.clone()),
        }
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Start building a data request.
    pub fn request(&self, url: impl UrlConvertible) -> RequestBuilder<Data> {
        RequestBuilder::new(self, Source::Url(url.as_url()))
    }

    /// Start building a data request from a prepared request.
    pub fn request_with(&self, request: impl RequestConvertible) -> RequestBuilder<Data> {
        RequestBuilder::new(self, Source::prepared(request))
    }

    /// Start building a download; the body is written to a file.
    pub fn download(&self, url: impl UrlConvertible) -> RequestBuilder<Download> {
        RequestBuilder::new(self, Source::Url(url.as_url()))
    }

    pub fn download_with(&self, request: impl RequestConvertible) -> RequestBuilder<Download> {
        RequestBuilder::new(self, Source::prepared(request))
    }

    /// Start building an upload. The method defaults to `POST`.
    pub fn upload(
        &self,
        uploadable: Uploadable,
        url: impl UrlConvertible,
    ) -> RequestBuilder<Upload> {
        let mut builder = RequestBuilder::new(self, Source::Url(url.as_url()));
        builder.method = Some(HttpMethod::Post);
        builder.upload = Some(uploadable);
        builder
    }

    /// Number of requests registered and not yet removed.
    pub fn active_request_count(&self) -> usize {
        self.inner.registry().len()
    }

    pub fn request_ids(&self) -> Vec<RequestId> {
        self.inner.registry().keys().copied().collect()
    }

    /// Cancel every registered request.
    pub fn cancel_all(&self) {
        let requests: Vec<Request> = self.inner.registry().values().cloned().collect();
        debug!("cancelling {} request(s)", requests.len());
        for request in requests {
            request.cancel();
        }
    }

    /// Wait for every currently registered request to reach a terminal state.
    pub async fn wait_all(&self) {
        let requests: Vec<Request> = self.inner.registry().values().cloned().collect();
        futures::future::join_all(requests.iter().map(Request::finished)).await;
    }
}

// ── Shared session ─────────────────────────────────────────────────

struct SharedSession {
    session: Session,
    _runtime: Runtime,
}

static SHARED: LazyLock<Result<SharedSession>> = LazyLock::new(|| {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("courier-shared")
        .enable_all()
        .build()
        .map_err(|e| Error::SessionConfiguration(format!("failed to start shared runtime: {e}")))?;
    let session = Session::builder().runtime(runtime.handle().clone()).build()?;
    debug!("shared session started");
    Ok(SharedSession {
        session,
        _runtime: runtime,
    })
});

/// Start a data request on the [shared session](Session::shared).
pub fn request(url: impl UrlConvertible) -> Result<RequestBuilder<Data>> {
    Ok(Session::shared()?.request(url))
}

/// Start a download on the [shared session](Session::shared).
pub fn download(url: impl UrlConvertible) -> Result<RequestBuilder<Download>> {
    Ok(Session::shared()?.download(url))
}

/// Start an upload on the [shared session](Session::shared).
pub fn upload(
    uploadable: Uploadable,
    url: impl UrlConvertible,
) -> Result<RequestBuilder<Upload>> {
    Ok(Session::shared()?.upload(uploadable, url))
}

impl SessionInner {
    fn registry(&self) -> MutexGuard<'_, HashMap<RequestId, Request>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn registered(&self, id: RequestId) -> Option<Request> {
        self.registry().get(&id).cloned()
    }

    fn remove(&self, id: RequestId) {
        self.registry().remove(&id);
    }

    fn retrier_for(&self, request: &Request) -> Option<Arc<dyn RequestInterceptor>> {
        request.interceptor().or_else(|| self.interceptor.clone())
    }

    /// Terminal transition and registry removal under the registry lock,
    /// then monitor notification.
    fn finish(&self, request: &Request, error: Option<Error>) {
        let transitioned = {
            let mut registry = self.registry();
            let transitioned = request.transition_to_finished(error);
            registry.remove(&request.id());
            transitioned
        };
        if transitioned {
            match request.error() {
                Some(e) => debug!("[{}] finished with error: {e}", request.id()),
                None => debug!("[{}] finished", request.id()),
            }
            request.notify_completion();
        }
    }

    async fn dispatch(session: Weak<SessionInner>, request: Request, setup: Setup) {
        let Some(session) = session.upgrade() else {
            request.finish(Some(Error::SessionDeinitialized));
            return;
        };
        if request.is_terminal() {
            return;
        }
        let kind = match session.build_request(setup) {
            Ok((url_request, kind)) => {
                debug!(
                    "[{}] dispatching {} {}",
                    request.id(),
                    url_request.method,
                    url_request.url
                );
                request.set_original(url_request);
                kind
            }
            Err(e) => {
                debug!("[{}] could not build request: {e}", request.id());
                request.finish(Some(e));
                return;
            }
        };
        session.start_attempt(request, kind).await;
    }

    fn build_request(&self, setup: Setup) -> Result<(UrlRequest, TaskKind)> {
        let mut request = match setup.source {
            Source::Url(url) => UrlRequest {
                url: url?,
                method: setup.method.unwrap_or_default(),
                headers: HttpHeaders::new(),
                body: None,
                timeout: None,
            },
            Source::Prepared(prepared) => {
                let mut request = prepared?;
                if let Some(method) = setup.method {
                    request.method = method;
                }
                request
            }
        };

        request.headers.merge(&setup.headers);
        for header in &self.config.default_headers {
            request.set_header_if_absent(&header.name, &header.value);
        }
        if let Some(user_agent) = &self.config.user_agent {
            request.set_header_if_absent("User-Agent", user_agent);
        }
        if setup.timeout.is_some() {
            request.timeout = setup.timeout;
        } else if request.timeout.is_none() {
            request.timeout = self.config.timeout;
        }

        if let Some(parameters) = &setup.parameters {
            request = setup.encoding.encode(request, Some(parameters))?;
        }
        if let Some(encode) = setup.encodable {
            request = encode(request)?;
        }

        let kind = match setup.upload {
            None => setup.kind,
            Some(Uploadable::Data(data)) => TaskKind::Upload(UploadBody::Data(data)),
            Some(Uploadable::File(path)) => TaskKind::Upload(UploadBody::File(path)),
            Some(Uploadable::Multipart(form)) => {
                let body = form.encode()?;
                request
                    .headers
                    .update(HttpHeader::content_type(form.content_type()));
                TaskKind::Upload(UploadBody::Data(body))
            }
        };
        Ok((request, kind))
    }

    /// Adapt the original request, create a task for the current attempt,
    /// register the request and start the task.
    async fn start_attempt(self: &Arc<Self>, request: Request, kind: TaskKind) {
        let Some(original) = request.original() else {
            return;
        };
        let adapted = match self.retrier_for(&request) {
            Some(interceptor) => interceptor
                .adapt(original)
                .await
                .map_err(|e| Error::RequestAdaptationFailed(Box::new(e))),
            None => Ok(original),
        };
        let adapted = match adapted {
            Ok(adapted) => adapted,
            Err(e) => {
                self.finish(&request, Some(e));
                return;
            }
        };
        request.set_adapted(adapted.clone());

        let attempt = request.attempt();
        let delegate = Arc::new(TaskEvents {
            session: Arc::downgrade(self),
            request_id: request.id(),
            attempt,
            kind: kind.clone(),
        });
        let task = match self.transport.create_task(kind, &adapted, delegate) {
            Ok(task) => task,
            Err(e) => {
                self.finish(&request, Some(e.into()));
                return;
            }
        };

        {
            let mut registry = self.registry();
            if request.is_terminal() {
                drop(registry);
                task.cancel();
                return;
            }
            registry.insert(request.id(), request.clone());
        }
        match request.attach_task(attempt, task.clone()) {
            Attached::Rejected => {
                task.cancel();
                self.remove(request.id());
            }
            Attached::Held => debug!("[{}] task held while suspended", request.id()),
            Attached::Started { announce } => {
                if announce {
                    request.notify(&RequestEvent::Resumed);
                }
            }
        }
    }

    async fn task_completed(
        self: Arc<Self>,
        request: Request,
        attempt: u64,
        kind: TaskKind,
        error: Option<TransportError>,
    ) {
        let Some((write_error, snapshot)) = request.close_attempt(attempt) else {
            if request.is_cancelled() {
                self.remove(request.id());
            }
            return;
        };
        let error = match error {
            Some(e) => Some(Error::SessionTaskFailed(e)),
            None => match write_error {
                Some(e) => Some(e),
                None => request.validate(&snapshot).await.err(),
            },
        };
        let Some(error) = error else {
            self.finish(&request, None);
            return;
        };

        let decision = match self.retrier_for(&request) {
            Some(retrier) => retrier.retry(&request, &error).await,
            None => RetryDecision::DoNotRetry,
        };
        match decision {
            RetryDecision::Retry => self.retry(request, kind, Duration::ZERO, &error).await,
            RetryDecision::RetryWithDelay(delay) => self.retry(request, kind, delay, &error).await,
            RetryDecision::DoNotRetry => self.finish(&request, Some(error)),
            RetryDecision::DoNotRetryWithError(retry_error) => self.finish(
                &request,
                Some(Error::RequestRetryFailed {
                    retry_error: Box::new(retry_error),
                    original_error: Box::new(error),
                }),
            ),
        }
    }

    async fn retry(
        self: &Arc<Self>,
        request: Request,
        kind: TaskKind,
        delay: Duration,
        error: &Error,
    ) {
        let Some((retry_count, _)) = request.prepare_retry() else {
            self.remove(request.id());
            return;
        };
        warn!(
            "[{}] retry {retry_count} in {:.1}s after: {error}",
            request.id(),
            delay.as_secs_f64()
        );
        request.notify(&RequestEvent::WillRetry { retry_count, delay });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if request.is_terminal() {
            self.remove(request.id());
            return;
        }
        self.start_attempt(request, kind).await;
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let registry = self.registry.get_mut().unwrap_or_else(|e| e.into_inner());
        let requests: Vec<Request> = registry.drain().map(|(_, request)| request).collect();
        if !requests.is_empty() {
            debug!("session dropped with {} request(s) in flight", requests.len());
        }
        for request in requests {
            request.cancel();
        }
    }
}

// ── Transport callbacks ────────────────────────────────────────────

/// Routes one attempt's transport callbacks to its request via the registry.
struct TaskEvents {
    session: Weak<SessionInner>,
    request_id: RequestId,
    attempt: u64,
    kind: TaskKind,
}

impl TaskEvents {
    fn lookup(&self) -> Option<(Arc<SessionInner>, Request)> {
        let session = self.session.upgrade()?;
        let request = session.registered(self.request_id)?;
        Some((session, request))
    }
}

impl TaskDelegate for TaskEvents {
    fn did_receive_response(&self, response: ResponseMetadata) {
        if let Some((_, request)) = self.lookup() {
            request.did_receive_response(self.attempt, response);
        }
    }

    fn did_receive_data(&self, data: Bytes) {
        if let Some((_, request)) = self.lookup() {
            request.did_receive_data(self.attempt, &data);
        }
    }

    fn did_complete(&self, error: Option<TransportError>) {
        let Some((session, request)) = self.lookup() else {
            return;
        };
        if request.is_cancelled() {
            session.remove(self.request_id);
            return;
        }
        if !request.is_current(self.attempt) {
            return;
        }
        let runtime = session.runtime.clone();
        runtime.spawn(session.task_completed(request, self.attempt, self.kind.clone(), error));
    }
}

// ── Builders ───────────────────────────────────────────────────────

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Data {}
    impl Sealed for super::Download {}
    impl Sealed for super::Upload {}
}

/// Marker for data requests.
#[derive(Debug)]
pub struct Data;
/// Marker for download requests.
#[derive(Debug)]
pub struct Download;
/// Marker for upload requests.
#[derive(Debug)]
pub struct Upload;

/// The kind of request a [`RequestBuilder`] produces.
pub trait RequestKind: sealed::Sealed {
    type Handle;

    #[doc(hidden)]
    fn task_kind() -> TaskKind;

    #[doc(hidden)]
    fn wrap(request: Request) -> Self::Handle;
}

impl RequestKind for Data {
    type Handle = DataRequest;

    fn task_kind() -> TaskKind {
        TaskKind::Data
    }

    fn wrap(request: Request) -> DataRequest {
        DataRequest(request)
    }
}

impl RequestKind for Download {
    type Handle = DownloadRequest;

    fn task_kind() -> TaskKind {
        TaskKind::Download
    }

    fn wrap(request: Request) -> DownloadRequest {
        DownloadRequest(request)
    }
}

impl RequestKind for Upload {
    type Handle = DataRequest;

    fn task_kind() -> TaskKind {
        TaskKind::Data
    }

    fn wrap(request: Request) -> DataRequest {
        DataRequest(request)
    }
}

enum Source {
    Url(Result<Url>),
    Prepared(Result<UrlRequest>),
}

impl Source {
    fn prepared(request: impl RequestConvertible) -> Self {
        Source::Prepared(
            request
                .as_url_request()
                .map_err(|e| Error::CreateUrlRequestFailed(Arc::new(e))),
        )
    }
}

type EncodeStep = Box<dyn FnOnce(UrlRequest) -> Result<UrlRequest> + Send>;

/// Everything dispatch needs to build the request off the caller's task.
struct Setup {
    source: Source,
    method: Option<HttpMethod>,
    headers: HttpHeaders,
    parameters: Option<Parameters>,
    encoding: Arc<dyn ParameterEncoding>,
    encodable: Option<EncodeStep>,
    timeout: Option<Duration>,
    upload: Option<Uploadable>,
    kind: TaskKind,
}

/// Configures one request; [`send`](RequestBuilder::send) dispatches it.
#[must_use = "a request is only sent by calling `send`"]
pub struct RequestBuilder<K> {
    session: Session,
    source: Source,
    method: Option<HttpMethod>,
    headers: HttpHeaders,
    parameters: Option<Parameters>,
    encoding: Arc<dyn ParameterEncoding>,
    encodable: Option<EncodeStep>,
    timeout: Option<Duration>,
    interceptor: Option<Arc<dyn RequestInterceptor>>,
    validators: Vec<Validation>,
    delivery: Option<DeliveryQueue>,
    destination: Option<PathBuf>,
    upload: Option<Uploadable>,
    _kind: PhantomData<K>,
}

impl<K: RequestKind> RequestBuilder<K> {
    fn new(session: &Session, source: Source) -> Self {
        Self {
            session: session.clone(),
            source,
            method: None,
            headers: HttpHeaders::new(),
            parameters: None,
            encoding: Arc::new(UrlEncoding::default()),
            encodable: None,
            timeout: None,
            interceptor: None,
            validators: Vec::new(),
            delivery: None,
            destination: None,
            upload: None,
            _kind: PhantomData,
        }
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = Some(method);
        self
    }

    /// Untyped parameters, encoded with [`encoding`](Self::encoding)
    /// (URL encoding by default).
    pub fn parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn encoding(mut self, encoding: impl ParameterEncoding + 'static) -> Self {
        self.encoding = Arc::new(encoding);
        self
    }

    /// Typed parameters encoded by `encoder`.
    pub fn encodable<P, E>(mut self, parameters: P, encoder: E) -> Self
    where
        P: Serialize + Send + 'static,
        E: ParameterEncoder + 'static,
    {
        self.encodable = Some(Box::new(move |request| {
            encoder.encode(Some(&parameters), request)
        }));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    /// Merge `headers`, replacing any with the same name.
    pub fn headers(mut self, headers: &HttpHeaders) -> Self {
        self.headers.merge(headers);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Interceptor for this request only; replaces the session default.
    pub fn interceptor(mut self, interceptor: impl RequestInterceptor + 'static) -> Self {
        self.interceptor = Some(Arc::new(interceptor));
        self
    }

    /// Where this request's `on_response*` handlers run.
    pub fn deliver_on(mut self, queue: DeliveryQueue) -> Self {
        self.delivery = Some(queue);
        self
    }

    /// Status code in `200..300` and an acceptable content type.
    pub fn validate(self) -> Self {
        self.validate_with(Validation::default_checks())
    }

    pub fn validate_status<R>(self, range: R) -> Self
    where
        R: RangeBounds<u16> + Send + Sync + 'static,
    {
        self.validate_with(Validation::status_code(range))
    }

    pub fn validate_content_type<I, S>(self, acceptable: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.validate_with(Validation::content_type(acceptable))
    }

    pub fn validate_with(mut self, validation: Validation) -> Self {
        self.validators.push(validation);
        self
    }

    /// Create the request and dispatch it on the session runtime.
    pub fn send(self) -> K::Handle {
        let inner = &self.session.inner;
        let destination = match K::task_kind() {
            TaskKind::Download => Some(self.destination.unwrap_or_else(|| {
                std::env::temp_dir().join(format!("courier-{}.download", Uuid::new_v4()))
            })),
            _ => None,
        };
        let request = Request::new(RequestOptions {
            monitors: inner.monitors.clone(),
            interceptor: self.interceptor,
            validators: self.validators,
            delivery: self.delivery.unwrap_or_else(|| inner.delivery.clone()),
            runtime: Some(inner.runtime.clone()),
            destination,
        });
        let setup = Setup {
            source: self.source,
            method: self.method,
            headers: self.headers,
            parameters: self.parameters,
            encoding: self.encoding,
            encodable: self.encodable,
            timeout: self.timeout,
            upload: self.upload,
            kind: K::task_kind(),
        };
        let weak = Arc::downgrade(inner);
        inner
            .runtime
            .spawn(SessionInner::dispatch(weak, request.clone(), setup));
        K::wrap(request)
    }
}

impl RequestBuilder<Download> {
    /// File the body is written to. Defaults to a file in the temp directory.
    pub fn destination(mut self, path: impl Into<PathBuf>) -> Self {
        self.destination = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::MainQueue;
    use crate::error::{ParameterEncodingFailure, ResponseValidationFailure, TransportErrorKind};
    use crate::interceptor::{FnAdapter, FnRetrier, Interceptor};
    use crate::monitor::FnMonitor;
    use crate::multipart::MultipartFormData;
    use crate::request::Phase;
    use crate::retry::RetryPolicy;
    use crate::transport::mock::{MockTransport, Reply, TaskCall};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn session_with(transport: Arc<MockTransport>) -> Session {
        Session::builder().transport(transport).build().unwrap()
    }

    /// Event names recorded by a monitor, in order.
    fn recording_session(transport: Arc<MockTransport>) -> (Session, Arc<Mutex<Vec<String>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let session = Session::builder()
            .transport(transport)
            .monitor(FnMonitor::new(move |_: &Request, event: &RequestEvent<'_>| {
                let name = match event {
                    RequestEvent::Resumed => "resumed",
                    RequestEvent::Suspended => "suspended",
                    RequestEvent::Cancelled => "cancelled",
                    RequestEvent::ResponseReceived(_) => "response",
                    RequestEvent::DataReceived(_) => "data",
                    RequestEvent::WillRetry { .. } => "will_retry",
                    RequestEvent::Failed(_) => "failed",
                    RequestEvent::Finished => "finished",
                };
                sink.lock().unwrap().push(name.to_string());
            }))
            .build()
            .unwrap();
        (session, events)
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition never became true");
    }

    fn fast_retries(limit: u32) -> Interceptor {
        Interceptor::new().with_retrier(RetryPolicy::with_retries(limit).with_backoff(2, 0.001))
    }

    #[tokio::test]
    async fn build_requires_runtime_or_handle() {
        let transport = MockTransport::new(Reply::ok("x"));
        let session = Session::builder()
            .transport(transport)
            .runtime(Handle::current())
            .build();
        assert!(session.is_ok());
    }

    #[test]
    fn build_without_runtime_fails() {
        let err = Session::builder()
            .transport(MockTransport::new(Reply::ok("x")))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::SessionConfiguration(_)));
    }

    #[test]
    fn shared_session_is_built_once_without_an_ambient_runtime() {
        let first = Session::shared().unwrap();
        let second = Session::shared().unwrap();
        assert!(Arc::ptr_eq(&first.inner, &second.inner));
    }

    #[test]
    fn shortcut_failure_completes_from_sync_code() {
        let request = request("not a url").unwrap().send();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let response = runtime.block_on(request.response());
        assert!(matches!(
            response.error(),
            Some(Error::ParameterEncodingFailed(ParameterEncodingFailure::MissingUrl))
        ));
    }

    #[tokio::test]
    async fn successful_request_lifecycle() {
        let transport = MockTransport::new(Reply::ok("hello"));
        let (session, events) = recording_session(transport.clone());

        let request = session.request("https://example.com/greeting").send();
        let response = request.response_string().await;

        assert_eq!(response.value(), Some(&"hello".to_string()));
        assert_eq!(response.response.as_ref().map(|r| r.status), Some(200));
        assert_eq!(request.phase(), Phase::Finished);
        assert!(request.is_finished());
        assert!(!request.is_cancelled());
        assert_eq!(
            *events.lock().unwrap(),
            vec!["resumed", "response", "data", "finished"]
        );
        eventually(|| session.active_request_count() == 0).await;
        assert_eq!(transport.created(), 1);
    }

    #[tokio::test]
    async fn session_headers_apply_unless_overridden() {
        let transport = MockTransport::new(Reply::ok("ok"));
        let session = Session::builder()
            .transport(transport.clone())
            .config(
                SessionConfig::default()
                    .with_user_agent("tests/1.0")
                    .with_header("X-Env", "test")
                    .with_header("Accept", "text/plain"),
            )
            .build()
            .unwrap();

        session
            .request("https://example.com/")
            .header("Accept", "application/json")
            .send()
            .response()
            .await;

        let sent = &transport.requests()[0];
        assert_eq!(sent.headers.get("user-agent"), Some("tests/1.0"));
        assert_eq!(sent.headers.get("x-env"), Some("test"));
        assert_eq!(sent.headers.get("accept"), Some("application/json"));
    }

    #[tokio::test]
    async fn parameters_are_encoded_into_query() {
        let transport = MockTransport::new(Reply::ok("ok"));
        let session = session_with(transport.clone());
        let mut parameters = Parameters::new();
        parameters.insert("foo".into(), "bar".into());
        parameters.insert("baz".into(), "qux".into());

        session
            .request("https://example.com/search")
            .parameters(parameters)
            .send()
            .response()
            .await;

        let sent = &transport.requests()[0];
        assert_eq!(sent.url.query(), Some("baz=qux&foo=bar"));
        assert_eq!(sent.method, HttpMethod::Get);
    }

    #[tokio::test]
    async fn invalid_url_fails_without_a_task() {
        let transport = MockTransport::new(Reply::ok("ok"));
        let (session, events) = recording_session(transport.clone());

        let response = session.request("not a url").send().response().await;

        assert!(matches!(
            response.error(),
            Some(Error::ParameterEncodingFailed(ParameterEncodingFailure::MissingUrl))
        ));
        assert_eq!(transport.created(), 0);
        assert_eq!(*events.lock().unwrap(), vec!["failed", "finished"]);
    }

    #[tokio::test]
    async fn adapter_failure_is_wrapped() {
        let transport = MockTransport::new(Reply::ok("ok"));
        let session = Session::builder()
            .transport(transport.clone())
            .interceptor(Interceptor::new().with_adapter(FnAdapter(
                |_: UrlRequest| -> Result<UrlRequest> { Err(Error::msg("no token")) },
            )))
            .build()
            .unwrap();

        let response = session.request("https://example.com/").send().response().await;

        match response.error() {
            Some(Error::RequestAdaptationFailed(inner)) => {
                assert_eq!(inner.to_string(), "no token")
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(transport.created(), 0);
    }

    #[tokio::test]
    async fn request_interceptor_replaces_session_default() {
        let transport = MockTransport::new(Reply::ok("ok"));
        let session = Session::builder()
            .transport(transport.clone())
            .interceptor(Interceptor::new().with_adapter(FnAdapter(
                |r: UrlRequest| -> Result<UrlRequest> {
                    Ok(r.with_header(HttpHeader::new("X-Source", "session")))
                },
            )))
            .build()
            .unwrap();

        let request = session
            .request("https://example.com/")
            .interceptor(Interceptor::new().with_adapter(FnAdapter(
                |r: UrlRequest| -> Result<UrlRequest> {
                    Ok(r.with_header(HttpHeader::new("X-Source", "request")))
                },
            )))
            .send();
        request.response().await;

        assert_eq!(transport.requests()[0].headers.get("x-source"), Some("request"));
        assert_eq!(
            request.adapted_request().unwrap().headers.get("x-source"),
            Some("request")
        );
        assert!(request.request().unwrap().headers.get("x-source").is_none());
    }

    #[tokio::test]
    async fn dropped_session_before_dispatch() {
        let transport = MockTransport::new(Reply::ok("ok"));
        let session = session_with(transport.clone());
        let request = session.request("https://example.com/").send();
        drop(session);

        let response = request.response().await;
        assert!(matches!(response.error(), Some(Error::SessionDeinitialized)));
        assert_eq!(transport.created(), 0);
    }

    #[tokio::test]
    async fn cancel_before_dispatch_never_creates_a_task() {
        let transport = MockTransport::new(Reply::ok("ok"));
        let session = session_with(transport.clone());
        let request = session.request("https://example.com/").send();
        request.cancel();

        let response = request.response().await;
        assert!(response.error().is_some_and(Error::is_explicitly_cancelled));
        tokio::task::yield_now().await;
        assert_eq!(transport.created(), 0);
        assert_eq!(session.active_request_count(), 0);
    }

    #[tokio::test]
    async fn cancel_in_flight_removes_from_registry() {
        let transport = MockTransport::new(Reply::Hang);
        let (session, events) = recording_session(transport.clone());
        let request = session.request("https://example.com/slow").send();

        eventually(|| session.active_request_count() == 1).await;
        request.cancel();
        request.cancel();

        let response = request.response().await;
        assert!(response.error().is_some_and(Error::is_explicitly_cancelled));
        assert!(request.is_cancelled());
        eventually(|| session.active_request_count() == 0).await;
        let cancelled = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == "cancelled")
            .count();
        assert_eq!(cancelled, 1);
    }

    #[tokio::test]
    async fn concurrent_requests_are_tracked_until_complete() {
        let transport = MockTransport::new(Reply::ok("ok"));
        transport.close_gate();
        let session = session_with(transport.clone());

        let requests: Vec<DataRequest> = (0..8)
            .map(|i| session.request(format!("https://example.com/{i}")).send())
            .collect();
        eventually(|| session.active_request_count() == 8).await;

        let ids = session.request_ids();
        for request in &requests {
            assert!(ids.contains(&request.id()));
        }

        transport.open_gate();
        session.wait_all().await;
        for request in &requests {
            assert!(request.is_finished());
            assert!(request.error().is_none());
        }
        eventually(|| session.active_request_count() == 0).await;
    }

    #[tokio::test]
    async fn cancel_all_cancels_registered_requests() {
        let transport = MockTransport::new(Reply::Hang);
        let session = session_with(transport);
        let first = session.request("https://example.com/a").send();
        let second = session.request("https://example.com/b").send();
        eventually(|| session.active_request_count() == 2).await;

        session.cancel_all();
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
        eventually(|| session.active_request_count() == 0).await;
    }

    #[tokio::test]
    async fn suspend_and_resume_notify_once_per_flip() {
        let transport = MockTransport::new(Reply::ok("hello"));
        transport.close_gate();
        let (session, events) = recording_session(transport.clone());
        let request = session.request("https://example.com/held").send();
        eventually(|| events.lock().unwrap().len() == 1).await;

        request.resume();
        request.suspend();
        request.suspend();
        assert!(request.is_suspended());
        assert_eq!(request.phase(), Phase::Running);
        request.resume();
        request.resume();
        assert!(!request.is_suspended());
        assert_eq!(request.phase(), Phase::Running);

        transport.open_gate();
        let response = request.response_string().await;
        assert_eq!(response.value(), Some(&"hello".to_string()));
        assert_eq!(
            *events.lock().unwrap(),
            vec!["resumed", "suspended", "resumed", "response", "data", "finished"]
        );
        assert_eq!(
            transport.calls(),
            vec![TaskCall::Resume, TaskCall::Suspend, TaskCall::Resume]
        );
    }

    #[tokio::test]
    async fn suspend_before_dispatch_holds_the_task() {
        let transport = MockTransport::new(Reply::ok("hello"));
        let (session, events) = recording_session(transport.clone());
        let request = session.request("https://example.com/later").send();
        request.suspend();

        eventually(|| transport.created() == 1 && request.phase() == Phase::Running).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!request.is_terminal());
        assert!(transport.calls().is_empty());
        assert_eq!(*events.lock().unwrap(), vec!["suspended"]);

        request.resume();
        let response = request.response_string().await;
        assert_eq!(response.value(), Some(&"hello".to_string()));
        assert_eq!(
            *events.lock().unwrap(),
            vec!["suspended", "resumed", "response", "data", "finished"]
        );
        assert_eq!(transport.calls(), vec![TaskCall::Resume]);
    }

    #[tokio::test]
    async fn resume_before_dispatch_is_announced_once() {
        let transport = MockTransport::new(Reply::ok("hello"));
        let (session, events) = recording_session(transport.clone());
        let request = session.request("https://example.com/").send();
        request.suspend();
        request.resume();

        let response = request.response_string().await;
        assert!(response.error().is_none());
        assert_eq!(
            *events.lock().unwrap(),
            vec!["suspended", "resumed", "response", "data", "finished"]
        );
        assert_eq!(transport.calls(), vec![TaskCall::Resume]);
    }

    #[tokio::test]
    async fn suspend_and_resume_after_terminal_are_ignored() {
        let transport = MockTransport::new(Reply::ok("done"));
        let (session, events) = recording_session(transport.clone());

        let finished = session.request("https://example.com/a").send();
        finished.response().await;
        finished.suspend();
        finished.resume();
        assert!(!finished.is_suspended());
        assert_eq!(finished.phase(), Phase::Finished);

        let cancelled = session.request("https://example.com/b").send();
        cancelled.cancel();
        cancelled.suspend();
        cancelled.resume();
        assert!(!cancelled.is_suspended());
        assert_eq!(cancelled.phase(), Phase::Cancelled);

        let events = events.lock().unwrap().clone();
        assert!(!events.iter().any(|e| e == "suspended"));
        assert_eq!(events.iter().filter(|e| *e == "resumed").count(), 1);
        assert_eq!(transport.calls(), vec![TaskCall::Resume]);
    }

    #[tokio::test]
    async fn transient_failures_retry_up_to_the_limit() {
        let transport = MockTransport::new(Reply::fail(TransportErrorKind::TimedOut));
        let (session, events) = recording_session(transport.clone());

        let request = session
            .request("https://example.com/flaky")
            .interceptor(fast_retries(2))
            .send();
        let response = request.response().await;

        assert_eq!(request.retry_count(), 2);
        assert_eq!(response.metrics.as_ref().map(|m| m.retry_count), Some(2));
        assert_eq!(transport.created(), 3);
        assert_eq!(
            response.error().and_then(Error::transport_error).map(|e| e.kind),
            Some(TransportErrorKind::TimedOut)
        );
        let retries = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == "will_retry")
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn validated_status_retries_then_succeeds() {
        let transport = MockTransport::scripted(
            vec![Reply::status(503, "busy"), Reply::status(503, "busy")],
            Reply::ok("done"),
        );
        let session = Session::builder()
            .transport(transport.clone())
            .interceptor(fast_retries(2))
            .build()
            .unwrap();

        let request = session.request("https://example.com/").validate().send();
        let response = request.response_string().await;

        assert_eq!(response.value().map(String::as_str), Some("done"));
        assert_eq!(request.retry_count(), 2);
        assert_eq!(transport.created(), 3);
    }

    #[tokio::test]
    async fn validation_failure_without_retrier() {
        let transport = MockTransport::new(Reply::status(404, "missing"));
        let session = session_with(transport);

        let response = session
            .request("https://example.com/")
            .validate_status(200..300)
            .send()
            .response_string()
            .await;

        assert!(matches!(
            response.error(),
            Some(Error::ResponseValidationFailed(
                ResponseValidationFailure::UnacceptableStatusCode { code: 404 }
            ))
        ));
        assert_eq!(response.data.as_deref(), Some(&b"missing"[..]));
    }

    #[tokio::test]
    async fn retrier_error_wraps_original() {
        let transport = MockTransport::new(Reply::fail(TransportErrorKind::CannotConnectToHost));
        let session = Session::builder()
            .transport(transport)
            .interceptor(Interceptor::new().with_retrier(FnRetrier(|_: &Request, _: &Error| {
                RetryDecision::DoNotRetryWithError(Error::msg("refresh failed"))
            })))
            .build()
            .unwrap();

        let response = session.request("https://example.com/").send().response().await;
        match response.error() {
            Some(Error::RequestRetryFailed {
                retry_error,
                original_error,
            }) => {
                assert_eq!(retry_error.to_string(), "refresh failed");
                assert_eq!(
                    original_error.transport_error().map(|e| e.kind),
                    Some(TransportErrorKind::CannotConnectToHost)
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn multipart_upload_sets_content_type_and_body() {
        let transport = MockTransport::new(Reply::ok("stored"));
        let session = session_with(transport.clone());
        let mut form = MultipartFormData::with_boundary("test-boundary");
        form.append_text("name", "value");

        session
            .upload(Uploadable::Multipart(form), "https://example.com/upload")
            .send()
            .response()
            .await;

        let sent = &transport.requests()[0];
        assert_eq!(sent.method, HttpMethod::Post);
        assert_eq!(
            sent.headers.get("content-type"),
            Some("multipart/form-data; boundary=test-boundary")
        );
        match &transport.kinds()[0] {
            TaskKind::Upload(UploadBody::Data(body)) => {
                let text = String::from_utf8_lossy(body);
                assert!(text.contains("--test-boundary"));
                assert!(text.contains("name=\"name\""));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[tokio::test]
    async fn download_writes_to_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.txt");
        let transport = MockTransport::new(Reply::ok("file contents"));
        let session = session_with(transport.clone());

        let request = session
            .download("https://example.com/file")
            .destination(&path)
            .send();
        let response = request.response_url().await;

        assert_eq!(response.value(), Some(&path));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "file contents");
        assert_eq!(transport.kinds()[0], TaskKind::Download);
    }

    #[tokio::test]
    async fn download_content_type_is_checked_against_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::scripted(
            vec![Reply::ok("plain text")],
            Reply::status(200, ""),
        );
        let session = session_with(transport);

        let rejected = session
            .download("https://example.com/report")
            .destination(dir.path().join("report.json"))
            .validate_content_type(["application/json"])
            .send();
        let response = rejected.response_url().await;
        assert!(matches!(
            response.error(),
            Some(Error::ResponseValidationFailed(
                ResponseValidationFailure::UnacceptableContentType { .. }
            ))
        ));

        let empty = session
            .download("https://example.com/empty")
            .destination(dir.path().join("empty.json"))
            .validate_content_type(["application/json"])
            .send();
        assert!(empty.response_url().await.error().is_none());
    }

    #[tokio::test]
    async fn handlers_wait_for_main_queue_drain() {
        let transport = MockTransport::new(Reply::ok("queued"));
        let session = session_with(transport);
        let queue = MainQueue::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let request = session
            .request("https://example.com/")
            .deliver_on(queue.as_queue())
            .send();
        request.on_response_string(move |response| {
            assert_eq!(response.value().map(String::as_str), Some("queued"));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        request.finished().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.drain_next().await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
