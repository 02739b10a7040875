//! Response validation run before the retry chain and serialization.

use std::fmt;
use std::ops::{Range, RangeBounds};
use std::sync::Arc;

use super::ResponseMetadata;
use crate::error::{BoxError, Error, ResponseValidationFailure, Result};
use crate::url_request::UrlRequest;

pub const DEFAULT_ACCEPTABLE_STATUS_CODES: Range<u16> = 200..300;

pub const DEFAULT_ACCEPTABLE_CONTENT_TYPES: [&str; 4] =
    ["application/json", "text/json", "text/html", "text/plain"];

type Check =
    dyn Fn(Option<&UrlRequest>, &ResponseMetadata, Option<&[u8]>) -> Result<()> + Send + Sync;

/// A named check over a received response.
#[derive(Clone)]
pub struct Validation {
    name: &'static str,
    check: Arc<Check>,
}

impl fmt::Debug for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Validation").field(&self.name).finish()
    }
}

impl Validation {
    fn new(
        name: &'static str,
        check: impl Fn(Option<&UrlRequest>, &ResponseMetadata, Option<&[u8]>) -> Result<()>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            name,
            check: Arc::new(check),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Accept only status codes inside `range`.
    pub fn status_code<R>(range: R) -> Self
    where
        R: RangeBounds<u16> + Send + Sync + 'static,
    {
        Self::new("status_code", move |_, response, _| {
            if range.contains(&response.status) {
                Ok(())
            } else {
                Err(Error::ResponseValidationFailed(
                    ResponseValidationFailure::UnacceptableStatusCode {
                        code: response.status,
                    },
                ))
            }
        })
    }

    /// Accept only the listed status codes.
    pub fn status_codes(codes: impl IntoIterator<Item = u16>) -> Self {
        let codes: Vec<u16> = codes.into_iter().collect();
        Self::new("status_codes", move |_, response, _| {
            if codes.contains(&response.status) {
                Ok(())
            } else {
                Err(Error::ResponseValidationFailed(
                    ResponseValidationFailure::UnacceptableStatusCode {
                        code: response.status,
                    },
                ))
            }
        })
    }

    /// Accept only the listed MIME types; `type/*` and `*/*` are wildcards.
    /// Empty bodies are not checked.
    pub fn content_type<I, S>(acceptable: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let acceptable: Vec<String> = acceptable
            .into_iter()
            .map(|s| s.into().to_ascii_lowercase())
            .collect();
        Self::new("content_type", move |_, response, data| {
            if data.is_none_or(<[u8]>::is_empty) {
                return Ok(());
            }
            check_content_type(&acceptable, response)
        })
    }

    /// Status code in `200..300`, then a content type from
    /// [`DEFAULT_ACCEPTABLE_CONTENT_TYPES`].
    pub fn default_checks() -> Self {
        let status = Self::status_code(DEFAULT_ACCEPTABLE_STATUS_CODES);
        let content_type = Self::content_type(DEFAULT_ACCEPTABLE_CONTENT_TYPES);
        Self::new("default", move |request, response, data| {
            status.validate(request, response, data)?;
            content_type.validate(request, response, data)
        })
    }

    /// Caller-defined check. Errors become `CustomValidationFailed`.
    pub fn custom<F>(check: F) -> Self
    where
        F: Fn(Option<&UrlRequest>, &ResponseMetadata, Option<&[u8]>) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        Self::new("custom", move |request, response, data| {
            check(request, response, data).map_err(|e| {
                let failure = ResponseValidationFailure::CustomValidationFailed(e);
                Error::ResponseValidationFailed(failure)
            })
        })
    }

    pub fn validate(
        &self,
        request: Option<&UrlRequest>,
        response: &ResponseMetadata,
        data: Option<&[u8]>,
    ) -> Result<()> {
        (self.check)(request, response, data)
    }
}

fn check_content_type(acceptable: &[String], response: &ResponseMetadata) -> Result<()> {
    let Some(mime) = response.mime_type() else {
        if acceptable.iter().any(|a| a == "*/*") {
            return Ok(());
        }
        return Err(Error::ResponseValidationFailed(
            ResponseValidationFailure::MissingContentType {
                acceptable: acceptable.to_vec(),
            },
        ));
    };
    if acceptable.iter().any(|a| mime_matches(a, &mime)) {
        Ok(())
    } else {
        Err(Error::ResponseValidationFailed(
            ResponseValidationFailure::UnacceptableContentType {
                acceptable: acceptable.to_vec(),
                response: mime,
            },
        ))
    }
}

fn mime_matches(acceptable: &str, mime: &str) -> bool {
    if acceptable == "*/*" || acceptable == "*" {
        return true;
    }
    let (Some((a_type, a_sub)), Some((m_type, m_sub))) =
        (acceptable.split_once('/'), mime.split_once('/'))
    else {
        return false;
    };
    (a_type == "*" || a_type == m_type) && (a_sub == "*" || a_sub == m_sub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HttpHeaders;
    use url::Url;

    fn meta(status: u16, content_type: Option<&str>) -> ResponseMetadata {
        let headers: HttpHeaders = content_type
            .map(|ct| ("Content-Type", ct))
            .into_iter()
            .collect();
        ResponseMetadata::new(Url::parse("https://example.com/").unwrap(), status, headers)
    }

    #[test]
    fn status_code_range() {
        let v = Validation::status_code(200..300);
        assert!(v.validate(None, &meta(204, None), None).is_ok());
        let err = v.validate(None, &meta(503, None), None).unwrap_err();
        assert_eq!(err.response_code(), Some(503));
    }

    #[test]
    fn explicit_status_codes() {
        let v = Validation::status_codes([200, 304]);
        assert!(v.validate(None, &meta(304, None), None).is_ok());
        assert!(v.validate(None, &meta(201, None), None).is_err());
    }

    #[test]
    fn content_type_wildcards() {
        let v = Validation::content_type(["text/*"]);
        let body = Some(&b"x"[..]);
        assert!(v.validate(None, &meta(200, Some("text/csv; charset=utf-8")), body).is_ok());
        let err = v
            .validate(None, &meta(200, Some("application/json")), body)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ResponseValidationFailed(ResponseValidationFailure::UnacceptableContentType {
                ref response, ..
            }) if response == "application/json"
        ));
    }

    #[test]
    fn content_type_missing_header() {
        let v = Validation::content_type(["application/json"]);
        let err = v.validate(None, &meta(200, None), Some(b"{}")).unwrap_err();
        assert!(matches!(
            err,
            Error::ResponseValidationFailed(ResponseValidationFailure::MissingContentType { .. })
        ));
        assert!(
            Validation::content_type(["*/*"])
                .validate(None, &meta(200, None), Some(b"{}"))
                .is_ok()
        );
    }

    #[test]
    fn content_type_skipped_for_empty_body() {
        let v = Validation::content_type(["application/json"]);
        assert!(v.validate(None, &meta(204, None), None).is_ok());
        assert!(v.validate(None, &meta(200, Some("image/png")), Some(b"")).is_ok());
    }

    #[test]
    fn default_checks_status_first() {
        let v = Validation::default_checks();
        let err = v
            .validate(None, &meta(500, Some("image/png")), Some(b"x"))
            .unwrap_err();
        assert_eq!(err.response_code(), Some(500));
        assert!(v.validate(None, &meta(200, Some("text/html")), Some(b"x")).is_ok());
    }

    #[test]
    fn custom_errors_are_wrapped() {
        let v = Validation::custom(|_, response, _| {
            if response.headers.contains("X-Signature") {
                Ok(())
            } else {
                Err(Arc::new(Error::msg("unsigned")) as BoxError)
            }
        });
        let err = v.validate(None, &meta(200, None), None).unwrap_err();
        assert!(matches!(
            err,
            Error::ResponseValidationFailed(ResponseValidationFailure::CustomValidationFailed(_))
        ));
    }
}
