//! Error taxonomy for the request pipeline.
//!
//! Every stage of a call (URL resolution, parameter encoding, adaptation,
//! transport, validation, serialization, retry) reports failures as an
//! [`Error`]. Callers always observe this single type through the response
//! envelope, regardless of which stage failed.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Shared, clonable wrapper for foreign errors (adapter, decoder, encoder).
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by a [`Session`](crate::Session) call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Building the request from its URL and parameters failed.
    #[error("parameter encoding failed: {0}")]
    ParameterEncodingFailed(ParameterEncodingFailure),

    /// A typed serde parameter encoder failed.
    #[error("parameter encoder failed: {0}")]
    ParameterEncoderFailed(ParameterEncoderFailure),

    /// Encoding a multipart form body failed.
    #[error("multipart encoding failed: {0}")]
    MultipartEncodingFailed(MultipartEncodingFailure),

    /// A [`RequestConvertible`](crate::RequestConvertible) could not produce a request.
    #[error("create URL request failed: {0}")]
    CreateUrlRequestFailed(BoxError),

    /// An adapter in the interceptor chain rejected the request.
    #[error("request adaptation failed: {0}")]
    RequestAdaptationFailed(Box<Error>),

    /// The transport reported a failure.
    #[error("session task failed: {0}")]
    SessionTaskFailed(TransportError),

    /// A response validation rejected the response.
    #[error("response validation failed: {0}")]
    ResponseValidationFailed(ResponseValidationFailure),

    /// The response could not be serialized into the requested type.
    #[error("response serialization failed: {0}")]
    ResponseSerializationFailed(ResponseSerializationFailure),

    /// A retrier stopped the retry chain with its own error.
    #[error("request retry failed: {retry_error}, original: {original_error}")]
    RequestRetryFailed {
        retry_error: Box<Error>,
        original_error: Box<Error>,
    },

    /// The request was cancelled by the caller.
    #[error("request explicitly cancelled")]
    ExplicitlyCancelled,

    /// The session was dropped before the request could be dispatched.
    #[error("session deinitialized")]
    SessionDeinitialized,

    /// The session could not be constructed.
    #[error("session configuration error: {0}")]
    SessionConfiguration(String),

    /// Writing a downloaded chunk to its destination failed.
    #[error("failed to write download to {}: {reason}", path.display())]
    DownloadWriteFailed { path: PathBuf, reason: String },

    /// Caller-defined failure (custom adapters, retriers, validations).
    #[error("{0}")]
    Custom(BoxError),
}

impl Error {
    /// Wrap any foreign error as [`Error::Custom`].
    pub fn custom(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Custom(Arc::new(error))
    }

    /// Build an [`Error::Custom`] from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Custom(Arc::new(Message(message.into())))
    }

    pub fn is_explicitly_cancelled(&self) -> bool {
        matches!(self, Error::ExplicitlyCancelled)
    }

    /// The transport error behind this error, if any.
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Error::SessionTaskFailed(e) => Some(e),
            _ => None,
        }
    }

    /// The HTTP status code that failed validation, if any.
    pub fn response_code(&self) -> Option<u16> {
        match self {
            Error::ResponseValidationFailed(ResponseValidationFailure::UnacceptableStatusCode {
                code,
            }) => Some(*code),
            _ => None,
        }
    }

    pub fn is_response_serialization_error(&self) -> bool {
        matches!(self, Error::ResponseSerializationFailed(_))
    }

    pub fn is_response_validation_error(&self) -> bool {
        matches!(self, Error::ResponseValidationFailed(_))
    }
}

impl From<TransportError> for Error {
    fn from(error: TransportError) -> Self {
        Error::SessionTaskFailed(error)
    }
}

/// Plain-message error used by [`Error::msg`].
#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

// ── Failure reasons ────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum ParameterEncodingFailure {
    #[error("missing URL")]
    MissingUrl,
    #[error("JSON encoding failed: {0}")]
    JsonEncodingFailed(Arc<serde_json::Error>),
    #[error("custom encoding failed: {0}")]
    CustomEncodingFailed(BoxError),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ParameterEncoderFailure {
    #[error("missing required component: {0}")]
    MissingRequiredComponent(String),
    #[error("encoder failed: {0}")]
    EncoderFailed(BoxError),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MultipartEncodingFailure {
    #[error("body part file {} is unreadable: {reason}", path.display())]
    BodyPartFileNotReadable { path: PathBuf, reason: String },
    #[error("body part file {} is a directory", path.display())]
    BodyPartFileIsDirectory { path: PathBuf },
    #[error("body part file {} has no file name", path.display())]
    BodyPartFilenameInvalid { path: PathBuf },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResponseValidationFailure {
    #[error("response status code {code} was unacceptable")]
    UnacceptableStatusCode { code: u16 },
    #[error("response had no content type, expected one of {acceptable:?}")]
    MissingContentType { acceptable: Vec<String> },
    #[error("response content type {response:?} was not one of {acceptable:?}")]
    UnacceptableContentType {
        acceptable: Vec<String>,
        response: String,
    },
    #[error("custom validation failed: {0}")]
    CustomValidationFailed(BoxError),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResponseSerializationFailure {
    #[error("response data was nil or zero length")]
    InputDataNilOrZeroLength,
    #[error("response file was missing")]
    InputFileNil,
    #[error("response file {} could not be read: {reason}", path.display())]
    InputFileReadFailed { path: PathBuf, reason: String },
    #[error("string could not be decoded as {encoding}")]
    StringSerializationFailed { encoding: &'static str },
    #[error("JSON could not be parsed: {0}")]
    JsonSerializationFailed(Arc<serde_json::Error>),
    #[error("response could not be decoded: {0}")]
    DecodingFailed(BoxError),
    #[error("empty response is not valid for type {type_name}")]
    InvalidEmptyResponse { type_name: &'static str },
}

// ── Transport errors ───────────────────────────────────────────────

/// Classification of a transport failure, used by
/// [`RetryPolicy`](crate::RetryPolicy) to decide whether it is transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    TimedOut,
    CannotFindHost,
    CannotConnectToHost,
    NetworkConnectionLost,
    NotConnectedToInternet,
    DnsLookupFailed,
    SecureConnectionFailed,
    ServerCertificateUntrusted,
    ServerCertificateHasBadDate,
    ClientCertificateRejected,
    BadUrl,
    Cancelled,
    Other,
}

impl TransportErrorKind {
    /// The kinds [`RetryPolicy`](crate::RetryPolicy) retries by default.
    pub const DEFAULT_RETRYABLE: [TransportErrorKind; 6] = [
        TransportErrorKind::TimedOut,
        TransportErrorKind::CannotFindHost,
        TransportErrorKind::CannotConnectToHost,
        TransportErrorKind::NetworkConnectionLost,
        TransportErrorKind::NotConnectedToInternet,
        TransportErrorKind::DnsLookupFailed,
    ];
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportErrorKind::TimedOut => "timed out",
            TransportErrorKind::CannotFindHost => "cannot find host",
            TransportErrorKind::CannotConnectToHost => "cannot connect to host",
            TransportErrorKind::NetworkConnectionLost => "network connection lost",
            TransportErrorKind::NotConnectedToInternet => "not connected to internet",
            TransportErrorKind::DnsLookupFailed => "DNS lookup failed",
            TransportErrorKind::SecureConnectionFailed => "secure connection failed",
            TransportErrorKind::ServerCertificateUntrusted => "server certificate untrusted",
            TransportErrorKind::ServerCertificateHasBadDate => "server certificate has bad date",
            TransportErrorKind::ClientCertificateRejected => "client certificate rejected",
            TransportErrorKind::BadUrl => "bad URL",
            TransportErrorKind::Cancelled => "cancelled",
            TransportErrorKind::Other => "transport error",
        };
        f.write_str(label)
    }
}

/// A classified failure reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(TransportErrorKind::Cancelled, "task cancelled")
    }
}
