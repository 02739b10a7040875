use std::sync::Arc;

use bytes::Bytes;

use super::{JSON_CONTENT_TYPE, ParameterEncoding, Parameters};
use crate::error::{Error, ParameterEncodingFailure, Result};
use crate::url_request::UrlRequest;

/// Writes parameters as a JSON object body.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoding {
    pub pretty: bool,
}

impl JsonEncoding {
    pub fn pretty_printed() -> Self {
        Self { pretty: true }
    }
}

impl ParameterEncoding for JsonEncoding {
    fn encode(
        &self,
        mut request: UrlRequest,
        parameters: Option<&Parameters>,
    ) -> Result<UrlRequest> {
        let Some(parameters) = parameters else {
            return Ok(request);
        };
        let data = if self.pretty {
            serde_json::to_vec_pretty(parameters)
        } else {
            serde_json::to_vec(parameters)
        }
        .map_err(|e| {
            let failure = ParameterEncodingFailure::JsonEncodingFailed(Arc::new(e));
            Error::ParameterEncodingFailed(failure)
        })?;

        request.set_header_if_absent("Content-Type", JSON_CONTENT_TYPE);
        request.body = Some(Bytes::from(data));
        Ok(request)
    }
}
