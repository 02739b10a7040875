use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use super::form::{Destination, UrlEncoding};
use super::JSON_CONTENT_TYPE;
use crate::error::{Error, ParameterEncoderFailure, Result};
use crate::url_request::UrlRequest;

/// Encodes a typed `Serialize` value into a request.
pub trait ParameterEncoder: Send + Sync {
    fn encode<P: Serialize + ?Sized>(
        &self,
        parameters: Option<&P>,
        request: UrlRequest,
    ) -> Result<UrlRequest>;
}

fn encoder_failed(error: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::ParameterEncoderFailed(ParameterEncoderFailure::EncoderFailed(Arc::new(error)))
}

/// Serializes parameters as a JSON body.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonParameterEncoder {
    pub pretty: bool,
}

impl JsonParameterEncoder {
    pub fn pretty_printed() -> Self {
        Self { pretty: true }
    }
}

impl ParameterEncoder for JsonParameterEncoder {
    fn encode<P: Serialize + ?Sized>(
        &self,
        parameters: Option<&P>,
        mut request: UrlRequest,
    ) -> Result<UrlRequest> {
        let Some(parameters) = parameters else {
            return Ok(request);
        };
        let data = if self.pretty {
            serde_json::to_vec_pretty(parameters)
        } else {
            serde_json::to_vec(parameters)
        }
        .map_err(encoder_failed)?;

        request.set_header_if_absent("Content-Type", JSON_CONTENT_TYPE);
        request.body = Some(Bytes::from(data));
        Ok(request)
    }
}

/// Serializes a keyed value as `application/x-www-form-urlencoded`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UrlEncodedFormParameterEncoder {
    pub encoding: UrlEncoding,
}

impl UrlEncodedFormParameterEncoder {
    pub fn with_destination(destination: Destination) -> Self {
        Self {
            encoding: UrlEncoding {
                destination,
                ..Default::default()
            },
        }
    }
}

impl ParameterEncoder for UrlEncodedFormParameterEncoder {
    fn encode<P: Serialize + ?Sized>(
        &self,
        parameters: Option<&P>,
        request: UrlRequest,
    ) -> Result<UrlRequest> {
        let Some(parameters) = parameters else {
            return Ok(request);
        };
        if self.encoding.destination.encodes_in_url(request.method)
            && request.url.cannot_be_a_base()
        {
            return Err(Error::ParameterEncoderFailed(
                ParameterEncoderFailure::MissingRequiredComponent("URL components".into()),
            ));
        }

        let map = match serde_json::to_value(parameters).map_err(encoder_failed)? {
            Value::Object(map) => map,
            other => {
                return Err(Error::ParameterEncoderFailed(
                    ParameterEncoderFailure::MissingRequiredComponent(format!(
                        "keyed container (got {})",
                        json_type_name(&other)
                    )),
                ));
            }
        };
        let query = self.encoding.query(&map);
        Ok(self.encoding.apply(request, query))
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
