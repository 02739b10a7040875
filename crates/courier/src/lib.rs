//! Session-based async HTTP client.
//!
//! Callers build requests through a [`Session`], which dispatches them on a
//! tokio runtime, tracks every in-flight [`Request`] in a registry, runs an
//! [`Interceptor`] chain to adapt requests and decide on retries, and hands
//! back typed [`DataResponse`] envelopes produced by a [`ResponseSerializer`].
//!
//! ```ignore
//! use courier::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> courier::Result<()> {
//!     let session = Session::builder()
//!         .interceptor(
//!             Interceptor::new()
//!                 .with_adapter(FnAdapter(|r: UrlRequest| -> courier::Result<UrlRequest> {
//!                     Ok(r.with_header(HttpHeader::authorization_bearer("token")))
//!                 }))
//!                 .with_retrier(RetryPolicy::default()),
//!         )
//!         .monitor(LoggingMonitor)
//!         .build()?;
//!
//!     let response = session
//!         .request("https://httpbin.org/get")
//!         .validate()
//!         .send()
//!         .response_json()
//!         .await;
//!     println!("{response}");
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Send requests:** [`Session`], [`SessionBuilder`], [`SessionConfig`] and
//!   the per-request [`RequestBuilder`](session::RequestBuilder). The
//!   [`request()`], [`download()`] and [`upload()`] shortcuts use
//!   [`Session::shared`].
//! - **Control a request:** [`Request`] (`cancel`, `suspend`, `resume`,
//!   `retry_count`) and the typed handles [`DataRequest`], [`DownloadRequest`].
//! - **Encode parameters:** [`encoding`] for URL and JSON encodings plus the
//!   serde-based encoders; [`MultipartFormData`] for multipart bodies.
//! - **Adapt and retry:** [`interceptor`] and [`RetryPolicy`].
//! - **Turn bytes into values:** [`response`] serializers and [`Validation`].
//! - **Observe:** [`EventMonitor`] implementations in [`monitor`].
//! - **Plug in a network stack:** the [`transport`] traits; the default is
//!   [`ReqwestTransport`](transport::ReqwestTransport).

pub mod delivery;
pub mod encoding;
pub mod error;
pub mod headers;
pub mod interceptor;
pub mod method;
pub mod monitor;
pub mod multipart;
pub mod prelude;
pub mod reachability;
pub mod request;
pub mod response;
pub mod retry;
pub mod session;
pub mod transport;
pub mod url_request;

pub use delivery::{DeliveryQueue, MainQueue};
pub use error::{Error, Result, TransportError, TransportErrorKind};
pub use headers::{HttpHeader, HttpHeaders};
pub use interceptor::{Interceptor, RequestAdapter, RequestRetrier, RetryDecision};
pub use method::HttpMethod;
pub use monitor::{EventMonitor, LoggingMonitor, RequestEvent};
pub use multipart::MultipartFormData;
pub use reachability::{NetworkReachabilityManager, ReachabilityStatus};
pub use request::{DataRequest, DownloadRequest, Phase, Request, RequestId, Uploadable};
pub use response::{DataResponse, DownloadResponse, ResponseSerializer, Validation};
pub use retry::RetryPolicy;
pub use session::{Session, SessionBuilder, SessionConfig, download, request, upload};
pub use url_request::{RequestConvertible, UrlConvertible, UrlRequest};
