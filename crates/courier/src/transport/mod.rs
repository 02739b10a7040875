//! The seam between the request pipeline and the network.
//!
//! A [`Transport`] creates one task per attempt. Tasks start suspended; the
//! session resumes them once the request is registered. Progress is reported
//! through a [`TaskDelegate`] in order: at most one response, then data
//! chunks, then exactly one completion.

mod http;

#[cfg(test)]
pub(crate) mod mock;

pub use self::http::ReqwestTransport;

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::TransportError;
use crate::response::ResponseMetadata;
use crate::url_request::UrlRequest;

/// What a task does with its request.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    /// Send the request body (if any) and stream the response.
    Data,
    /// Like `Data`; the request writes the response to disk.
    Download,
    /// Send the upload body instead of the request body.
    Upload(UploadBody),
}

/// Body of an upload task.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadBody {
    Data(Bytes),
    /// Read by the transport when the task starts.
    File(PathBuf),
}

/// Receives a task's progress. Implementations must be cheap; they run on
/// the transport's tasks.
pub trait TaskDelegate: Send + Sync {
    fn did_receive_response(&self, response: ResponseMetadata);
    fn did_receive_data(&self, data: Bytes);
    /// Called exactly once. A cancelled task reports
    /// [`TransportErrorKind::Cancelled`](crate::error::TransportErrorKind::Cancelled).
    fn did_complete(&self, error: Option<TransportError>);
}

/// Control over a running transport task.
///
/// `cancel` must eventually produce a `did_complete` callback. None of the
/// methods may call the delegate synchronously; `resume` and `suspend` are
/// invoked while the request's state is locked. Delivery pauses while a task
/// is suspended.
pub trait TaskHandle: Send + Sync {
    fn id(&self) -> u64;
    fn resume(&self);
    fn suspend(&self);
    fn cancel(&self);
}

/// Creates transport tasks.
pub trait Transport: Send + Sync {
    /// Create a suspended task for `request`.
    fn create_task(
        &self,
        kind: TaskKind,
        request: &UrlRequest,
        delegate: Arc<dyn TaskDelegate>,
    ) -> Result<Arc<dyn TaskHandle>, TransportError>;
}
