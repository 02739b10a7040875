//! Request descriptions and the conversions that produce them.

use std::time::Duration;

use bytes::Bytes;
use tracing::debug;
use url::Url;

use crate::error::{Error, ParameterEncodingFailure, Result};
use crate::headers::{HttpHeader, HttpHeaders};
use crate::method::HttpMethod;

/// A fully-formed request, ready to hand to a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlRequest {
    pub url: Url,
    pub method: HttpMethod,
    pub headers: HttpHeaders,
    pub body: Option<Bytes>,
    /// Per-request timeout. `None` uses the session default.
    pub timeout: Option<Duration>,
}

impl UrlRequest {
    /// Resolve `url` and build a request with no body.
    pub fn new(url: impl UrlConvertible, method: HttpMethod) -> Result<Self> {
        Ok(Self {
            url: url.as_url()?,
            method,
            headers: HttpHeaders::new(),
            body: None,
            timeout: None,
        })
    }

    pub fn get(url: impl UrlConvertible) -> Result<Self> {
        Self::new(url, HttpMethod::Get)
    }

    pub fn with_header(mut self, header: HttpHeader) -> Self {
        self.headers.update(header);
        self
    }

    pub fn with_headers(mut self, headers: &HttpHeaders) -> Self {
        self.headers.merge(headers);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set a header only when the request does not already carry it.
    pub fn set_header_if_absent(&mut self, name: &str, value: &str) {
        if !self.headers.contains(name) {
            self.headers.add(name, value);
        }
    }
}

// ── Conversions ────────────────────────────────────────────────────

/// Anything that can be resolved into an absolute [`Url`].
pub trait UrlConvertible {
    fn as_url(&self) -> Result<Url>;
}

impl UrlConvertible for str {
    fn as_url(&self) -> Result<Url> {
        Url::parse(self).map_err(|e| {
            debug!("URL resolution failed for {self:?}: {e}");
            Error::ParameterEncodingFailed(ParameterEncodingFailure::MissingUrl)
        })
    }
}

impl UrlConvertible for String {
    fn as_url(&self) -> Result<Url> {
        self.as_str().as_url()
    }
}

impl UrlConvertible for Url {
    fn as_url(&self) -> Result<Url> {
        Ok(self.clone())
    }
}

impl<T: UrlConvertible + ?Sized> UrlConvertible for &T {
    fn as_url(&self) -> Result<Url> {
        (**self).as_url()
    }
}

/// Anything that can produce a complete [`UrlRequest`].
pub trait RequestConvertible {
    fn as_url_request(&self) -> Result<UrlRequest>;
}

impl RequestConvertible for UrlRequest {
    fn as_url_request(&self) -> Result<UrlRequest> {
        Ok(self.clone())
    }
}

impl<T: RequestConvertible + ?Sized> RequestConvertible for &T {
    fn as_url_request(&self) -> Result<UrlRequest> {
        (**self).as_url_request()
    }
}
