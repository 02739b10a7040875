use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::{TaskDelegate, TaskHandle, TaskKind, Transport, UploadBody};
use crate::error::{Error, Result, TransportError, TransportErrorKind};
use crate::headers::HttpHeaders;
use crate::method::HttpMethod;
use crate::response::ResponseMetadata;
use crate::url_request::UrlRequest;

/// Default timeout applied when neither the request nor the transport sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
    next_id: Arc<AtomicU64>,
}

impl ReqwestTransport {
    /// Create a transport with a default client.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("courier/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::SessionConfiguration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client))
    }

    /// Wrap an existing client (proxies, TLS roots, pools are configured there).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: DEFAULT_TIMEOUT,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build(&self, kind: &TaskKind, request: &UrlRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), request.url.clone())
            .timeout(request.timeout.unwrap_or(self.timeout));
        for header in &request.headers {
            builder = builder.header(header.name.as_str(), header.value.as_str());
        }
        match kind {
            TaskKind::Upload(UploadBody::Data(body)) => builder.body(body.clone()),
            TaskKind::Upload(UploadBody::File(_)) => builder,
            TaskKind::Data | TaskKind::Download => match &request.body {
                Some(body) => builder.body(body.clone()),
                None => builder,
            },
        }
    }
}

impl Transport for ReqwestTransport {
    fn create_task(
        &self,
        kind: TaskKind,
        request: &UrlRequest,
        delegate: Arc<dyn TaskDelegate>,
    ) -> Result<Arc<dyn TaskHandle>, TransportError> {
        let runtime = Handle::try_current().map_err(|e| {
            TransportError::new(TransportErrorKind::Other, format!("no tokio runtime: {e}"))
        })?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (state, _) = watch::channel(TaskState::Suspended);
        let state = Arc::new(state);

        let builder = self.build(&kind, request);
        let upload_file = match kind {
            TaskKind::Upload(UploadBody::File(path)) => Some(path),
            _ => None,
        };
        let label = format!("{} {}", request.method, request.url);
        runtime.spawn(run_task(id, label, builder, upload_file, state.clone(), delegate));

        Ok(Arc::new(ReqwestTask { id, state }))
    }
}

// ── Tasks ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Suspended,
    Running,
    Cancelled,
}

struct ReqwestTask {
    id: u64,
    state: Arc<watch::Sender<TaskState>>,
}

impl ReqwestTask {
    fn transition(&self, to: TaskState) {
        self.state.send_if_modified(|state| {
            if *state == TaskState::Cancelled || *state == to {
                false
            } else {
                *state = to;
                true
            }
        });
    }
}

impl TaskHandle for ReqwestTask {
    fn id(&self) -> u64 {
        self.id
    }

    fn resume(&self) {
        self.transition(TaskState::Running);
    }

    fn suspend(&self) {
        self.transition(TaskState::Suspended);
    }

    fn cancel(&self) {
        self.transition(TaskState::Cancelled);
    }
}

/// Wait until the task may proceed. `false` means it was cancelled.
async fn proceed(state: &watch::Sender<TaskState>) -> bool {
    let mut rx = state.subscribe();
    match rx.wait_for(|s| *s != TaskState::Suspended).await {
        Ok(s) => *s == TaskState::Running,
        Err(_) => false,
    }
}

async fn cancelled(state: &watch::Sender<TaskState>) {
    let mut rx = state.subscribe();
    let _ = rx.wait_for(|s| *s == TaskState::Cancelled).await;
}

async fn run_task(
    id: u64,
    label: String,
    mut builder: reqwest::RequestBuilder,
    upload_file: Option<std::path::PathBuf>,
    state: Arc<watch::Sender<TaskState>>,
    delegate: Arc<dyn TaskDelegate>,
) {
    if !proceed(&state).await {
        delegate.did_complete(Some(TransportError::cancelled()));
        return;
    }

    if let Some(path) = upload_file {
        match tokio::fs::read(&path).await {
            Ok(body) => builder = builder.body(body),
            Err(e) => {
                delegate.did_complete(Some(TransportError::new(
                    TransportErrorKind::Other,
                    format!("failed to read upload file {}: {e}", path.display()),
                )));
                return;
            }
        }
    }

    debug!("task {id}: {label}");
    let start = Instant::now();

    let sent = tokio::select! {
        sent = builder.send() => sent,
        () = cancelled(&state) => {
            delegate.did_complete(Some(TransportError::cancelled()));
            return;
        }
    };
    let mut response = match sent {
        Ok(response) => response,
        Err(e) => {
            let error = classify(&e);
            debug!("task {id}: failed after {:.1}s: {error}", start.elapsed().as_secs_f64());
            delegate.did_complete(Some(error));
            return;
        }
    };

    let metadata = response_metadata(&response);
    debug!(
        "task {id}: HTTP {} in {:.1}s",
        metadata.status,
        start.elapsed().as_secs_f64()
    );
    delegate.did_receive_response(metadata);

    let mut received = 0usize;
    loop {
        if !proceed(&state).await {
            delegate.did_complete(Some(TransportError::cancelled()));
            return;
        }
        let chunk = tokio::select! {
            chunk = response.chunk() => chunk,
            () = cancelled(&state) => {
                delegate.did_complete(Some(TransportError::cancelled()));
                return;
            }
        };
        match chunk {
            Ok(Some(chunk)) => {
                received += chunk.len();
                trace!("task {id}: {} byte chunk", chunk.len());
                delegate.did_receive_data(chunk);
            }
            Ok(None) => break,
            Err(e) => {
                delegate.did_complete(Some(classify(&e)));
                return;
            }
        }
    }

    debug!(
        "task {id}: completed in {:.1}s ({received} bytes)",
        start.elapsed().as_secs_f64()
    );
    delegate.did_complete(None);
}

fn response_metadata(response: &reqwest::Response) -> ResponseMetadata {
    let headers: HttpHeaders = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    ResponseMetadata::new(response.url().clone(), response.status().as_u16(), headers)
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Connect => reqwest::Method::CONNECT,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Options => reqwest::Method::OPTIONS,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Trace => reqwest::Method::TRACE,
        HttpMethod::Query => {
            reqwest::Method::from_bytes(b"QUERY").unwrap_or(reqwest::Method::POST)
        }
    }
}

// ── Error classification ───────────────────────────────────────────

/// Map a reqwest failure onto a [`TransportErrorKind`].
fn classify(error: &reqwest::Error) -> TransportError {
    let message = error_chain(error);
    let io_kind = io_error_kind(error);
    let kind = classify_parts(
        error.is_timeout(),
        error.is_builder(),
        error.is_connect(),
        error.is_body() || error.is_decode(),
        io_kind,
        &message,
    );
    TransportError::new(kind, message)
}

fn classify_parts(
    is_timeout: bool,
    is_builder: bool,
    is_connect: bool,
    is_body: bool,
    io_kind: Option<std::io::ErrorKind>,
    message: &str,
) -> TransportErrorKind {
    use std::io::ErrorKind as Io;

    if is_timeout || io_kind == Some(Io::TimedOut) {
        return TransportErrorKind::TimedOut;
    }
    if is_builder {
        return TransportErrorKind::BadUrl;
    }

    let lower = message.to_lowercase();
    if lower.contains("dns error") || lower.contains("failed to lookup address") {
        return TransportErrorKind::DnsLookupFailed;
    }
    if lower.contains("no such host") || lower.contains("name or service not known") {
        return TransportErrorKind::CannotFindHost;
    }
    if lower.contains("certificate") {
        if lower.contains("expired") || lower.contains("not yet valid") {
            return TransportErrorKind::ServerCertificateHasBadDate;
        }
        if lower.contains("client") {
            return TransportErrorKind::ClientCertificateRejected;
        }
        return TransportErrorKind::ServerCertificateUntrusted;
    }
    if lower.contains("tls") || lower.contains("ssl") || lower.contains("handshake") {
        return TransportErrorKind::SecureConnectionFailed;
    }

    match io_kind {
        Some(Io::ConnectionRefused) => return TransportErrorKind::CannotConnectToHost,
        Some(Io::ConnectionReset | Io::ConnectionAborted | Io::BrokenPipe | Io::UnexpectedEof) => {
            return TransportErrorKind::NetworkConnectionLost;
        }
        Some(Io::NetworkUnreachable | Io::HostUnreachable | Io::NetworkDown) => {
            return TransportErrorKind::NotConnectedToInternet;
        }
        _ => {}
    }

    if is_connect {
        TransportErrorKind::CannotConnectToHost
    } else if is_body || lower.contains("connection closed") {
        TransportErrorKind::NetworkConnectionLost
    } else {
        TransportErrorKind::Other
    }
}

fn error_chain(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

fn io_error_kind(error: &reqwest::Error) -> Option<std::io::ErrorKind> {
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = inner.source();
    }
    None
}
