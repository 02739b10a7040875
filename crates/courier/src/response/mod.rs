//! Response envelopes, serializers and validation.

mod serializer;
mod validation;

pub use self::serializer::{
    DataDecoder, DataResponseSerializer, DecodableResponseSerializer, EmptyPolicy, JsonDecoder,
    JsonResponseSerializer, ResponseSerializer, StringResponseSerializer,
};
pub use self::validation::{
    DEFAULT_ACCEPTABLE_CONTENT_TYPES, DEFAULT_ACCEPTABLE_STATUS_CODES, Validation,
};

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use url::Url;

use crate::error::{Error, Result};
use crate::headers::HttpHeaders;
use crate::url_request::UrlRequest;

/// Status line and headers of a received response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMetadata {
    pub url: Url,
    pub status: u16,
    pub headers: HttpHeaders,
}

impl ResponseMetadata {
    pub fn new(url: Url, status: u16, headers: HttpHeaders) -> Self {
        Self {
            url,
            status,
            headers,
        }
    }

    /// Raw `Content-Type` header value.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("Content-Type")
    }

    /// Lowercased `type/subtype` of the content type, without parameters.
    pub fn mime_type(&self) -> Option<String> {
        let value = self.content_type()?;
        let essence = value.split(';').next().unwrap_or_default().trim();
        if essence.is_empty() {
            None
        } else {
            Some(essence.to_ascii_lowercase())
        }
    }

    /// The `charset` parameter of the content type, if declared.
    pub fn charset(&self) -> Option<String> {
        let value = self.content_type()?;
        value.split(';').skip(1).find_map(|param| {
            let (name, value) = param.split_once('=')?;
            if name.trim().eq_ignore_ascii_case("charset") {
                Some(value.trim().trim_matches('"').to_string())
            } else {
                None
            }
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Timing and retry information for a finished request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskMetrics {
    /// From the first task creation to the terminal transition.
    pub task_interval: Duration,
    pub retry_count: u32,
}

/// Outcome of a data, upload or streaming request.
#[derive(Debug, Clone)]
pub struct DataResponse<T> {
    /// The request as sent, after adaptation.
    pub request: Option<UrlRequest>,
    pub response: Option<ResponseMetadata>,
    pub data: Option<Bytes>,
    pub metrics: Option<TaskMetrics>,
    pub serialization_duration: Duration,
    pub result: Result<T>,
}

impl<T> DataResponse<T> {
    pub fn value(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&Error> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<T> {
        self.result
    }

    /// Transform the success value, keeping everything else.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> DataResponse<U> {
        DataResponse {
            request: self.request,
            response: self.response,
            data: self.data,
            metrics: self.metrics,
            serialization_duration: self.serialization_duration,
            result: self.result.map(f),
        }
    }
}

/// Outcome of a download request. The body lives at `file_url`.
#[derive(Debug, Clone)]
pub struct DownloadResponse<T> {
    pub request: Option<UrlRequest>,
    pub response: Option<ResponseMetadata>,
    pub file_url: Option<PathBuf>,
    pub metrics: Option<TaskMetrics>,
    pub serialization_duration: Duration,
    pub result: Result<T>,
}

impl<T> DownloadResponse<T> {
    pub fn value(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&Error> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

// ── Display ────────────────────────────────────────────────────────

fn write_common(
    f: &mut fmt::Formatter<'_>,
    request: Option<&UrlRequest>,
    response: Option<&ResponseMetadata>,
    metrics: Option<&TaskMetrics>,
) -> fmt::Result {
    match request {
        Some(r) => writeln!(f, "[Request]: {} {}", r.method, r.url)?,
        None => writeln!(f, "[Request]: None")?,
    }
    match response {
        Some(r) => writeln!(f, "[Response]: {} ({} headers)", r.status, r.headers.len())?,
        None => writeln!(f, "[Response]: None")?,
    }
    match metrics {
        Some(m) => writeln!(
            f,
            "[Network Duration]: {:.3}s, {} retries",
            m.task_interval.as_secs_f64(),
            m.retry_count
        ),
        None => writeln!(f, "[Network Duration]: None"),
    }
}

fn write_result<T: fmt::Debug>(f: &mut fmt::Formatter<'_>, result: &Result<T>) -> fmt::Result {
    match result {
        Ok(value) => write!(f, "[Result]: success({value:?})"),
        Err(e) => write!(f, "[Result]: failure({e})"),
    }
}

impl<T: fmt::Debug> fmt::Display for DataResponse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_common(f, self.request.as_ref(), self.response.as_ref(), self.metrics.as_ref())?;
        match &self.data {
            Some(data) => writeln!(f, "[Data]: {} bytes", data.len())?,
            None => writeln!(f, "[Data]: None")?,
        }
        writeln!(
            f,
            "[Serialization Duration]: {:.6}s",
            self.serialization_duration.as_secs_f64()
        )?;
        write_result(f, &self.result)
    }
}

impl<T: fmt::Debug> fmt::Display for DownloadResponse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_common(f, self.request.as_ref(), self.response.as_ref(), self.metrics.as_ref())?;
        match &self.file_url {
            Some(path) => writeln!(f, "[File URL]: {}", path.display())?,
            None => writeln!(f, "[File URL]: None")?,
        }
        writeln!(
            f,
            "[Serialization Duration]: {:.6}s",
            self.serialization_duration.as_secs_f64()
        )?;
        write_result(f, &self.result)
    }
}
