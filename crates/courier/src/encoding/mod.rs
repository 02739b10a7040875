//! Parameter encoding: turns caller parameters into query strings or bodies.
//!
//! Two families live here:
//!
//! - [`ParameterEncoding`] works on untyped [`Parameters`] (a JSON object) and
//!   is what the session builders use by default ([`UrlEncoding`] for
//!   query/form bodies, [`JsonEncoding`] for JSON bodies).
//! - [`ParameterEncoder`] encodes any `serde::Serialize` value
//!   ([`JsonParameterEncoder`], [`UrlEncodedFormParameterEncoder`]).

mod encoder;
mod form;
mod json;

pub use self::encoder::{JsonParameterEncoder, ParameterEncoder, UrlEncodedFormParameterEncoder};
pub use self::form::{ArrayEncoding, BoolEncoding, Destination, UrlEncoding};
pub use self::json::JsonEncoding;

use crate::error::Result;
use crate::url_request::UrlRequest;

/// Untyped request parameters.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Encodes [`Parameters`] into a request.
///
/// `None` parameters leave the request untouched.
pub trait ParameterEncoding: Send + Sync {
    fn encode(&self, request: UrlRequest, parameters: Option<&Parameters>) -> Result<UrlRequest>;
}

/// Content type written by the form encoders when the request has none.
pub(crate) const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

/// Content type written by the JSON encoders when the request has none.
pub(crate) const JSON_CONTENT_TYPE: &str = "application/json";
