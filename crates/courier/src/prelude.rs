//! Convenience re-exports for common `courier` types.
//!
//! ```ignore
//! use courier::prelude::*;
//! ```
//!
//! Transport traits and reachability are left out; import those from their
//! modules.

pub use crate::{Error, Result};

// ── Sessions and requests ──────────────────────────────────────────
pub use crate::request::{DataRequest, DownloadRequest, Request, RequestId, Uploadable};
pub use crate::session::{RequestBuilder, Session, SessionBuilder, SessionConfig};
pub use crate::url_request::{RequestConvertible, UrlConvertible, UrlRequest};
pub use crate::{HttpHeader, HttpHeaders, HttpMethod};

// ── Encoding ───────────────────────────────────────────────────────
pub use crate::encoding::{
    JsonEncoding, JsonParameterEncoder, ParameterEncoder, ParameterEncoding, Parameters,
    UrlEncodedFormParameterEncoder, UrlEncoding,
};
pub use crate::multipart::MultipartFormData;

// ── Interceptors ───────────────────────────────────────────────────
pub use crate::interceptor::{
    FnAdapter, FnRetrier, Interceptor, RequestAdapter, RequestRetrier, RetryDecision,
};
pub use crate::retry::RetryPolicy;

// ── Responses ──────────────────────────────────────────────────────
pub use crate::response::{
    DataResponse, DataResponseSerializer, DecodableResponseSerializer, DownloadResponse,
    JsonResponseSerializer, ResponseSerializer, StringResponseSerializer, Validation,
};

// ── Observation and delivery ───────────────────────────────────────
pub use crate::delivery::{DeliveryQueue, MainQueue};
pub use crate::monitor::{CompositeMonitor, EventMonitor, FnMonitor, LoggingMonitor, RequestEvent};
