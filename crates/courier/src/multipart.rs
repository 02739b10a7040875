//! `multipart/form-data` body builder.

use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::{Error, MultipartEncodingFailure, Result};
use crate::headers::HttpHeaders;

const CRLF: &str = "\r\n";

#[derive(Debug, Clone, PartialEq)]
enum PartSource {
    Data(Bytes),
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
struct BodyPart {
    headers: HttpHeaders,
    source: PartSource,
}

/// A multipart form. Files are read when the form is encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct MultipartFormData {
    boundary: String,
    parts: Vec<BodyPart>,
}

impl Default for MultipartFormData {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartFormData {
    pub fn new() -> Self {
        let (high, _) = Uuid::new_v4().as_u64_pair();
        Self::with_boundary(format!(
            "courier.boundary.{:08x}{:08x}",
            high >> 32,
            high & 0xffff_ffff
        ))
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            parts: Vec::new(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Value for the request's `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Append a plain form field.
    pub fn append_text(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        let value: String = value.into();
        self.append_data(Bytes::from(value), name, None, None)
    }

    pub fn append_data(
        &mut self,
        data: impl Into<Bytes>,
        name: &str,
        file_name: Option<&str>,
        mime_type: Option<&str>,
    ) -> &mut Self {
        let headers = part_headers(name, file_name, mime_type);
        self.parts.push(BodyPart {
            headers,
            source: PartSource::Data(data.into()),
        });
        self
    }

    /// Append a file; its name and MIME type come from the path.
    pub fn append_file(&mut self, path: impl Into<PathBuf>, name: &str) -> &mut Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string);
        let mime = mime_type_for(&path);
        let headers = part_headers(name, file_name.as_deref(), Some(mime));
        self.parts.push(BodyPart {
            headers,
            source: PartSource::File(path),
        });
        self
    }

    /// Append a file with an explicit file name and MIME type.
    pub fn append_file_as(
        &mut self,
        path: impl Into<PathBuf>,
        name: &str,
        file_name: &str,
        mime_type: &str,
    ) -> &mut Self {
        let headers = part_headers(name, Some(file_name), Some(mime_type));
        self.parts.push(BodyPart {
            headers,
            source: PartSource::File(path.into()),
        });
        self
    }

    /// Encode every part into a single body.
    pub fn encode(&self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        for part in &self.parts {
            let data = part.read()?;
            body.put_slice(format!("--{}{CRLF}", self.boundary).as_bytes());
            for header in &part.headers {
                body.put_slice(format!("{}: {}{CRLF}", header.name, header.value).as_bytes());
            }
            body.put_slice(CRLF.as_bytes());
            body.put_slice(&data);
            body.put_slice(CRLF.as_bytes());
        }
        body.put_slice(format!("--{}--{CRLF}", self.boundary).as_bytes());
        Ok(body.freeze())
    }
}

impl BodyPart {
    fn read(&self) -> Result<Bytes> {
        let path = match &self.source {
            PartSource::Data(data) => return Ok(data.clone()),
            PartSource::File(path) => path,
        };
        let fail = |reason: MultipartEncodingFailure| Error::MultipartEncodingFailed(reason);
        if path.file_name().is_none() {
            return Err(fail(MultipartEncodingFailure::BodyPartFilenameInvalid {
                path: path.clone(),
            }));
        }
        if path.is_dir() {
            return Err(fail(MultipartEncodingFailure::BodyPartFileIsDirectory {
                path: path.clone(),
            }));
        }
        std::fs::read(path).map(Bytes::from).map_err(|e| {
            fail(MultipartEncodingFailure::BodyPartFileNotReadable {
                path: path.clone(),
                reason: e.to_string(),
            })
        })
    }
}

fn part_headers(name: &str, file_name: Option<&str>, mime_type: Option<&str>) -> HttpHeaders {
    let mut disposition = format!("form-data; name=\"{name}\"");
    if let Some(file_name) = file_name {
        disposition.push_str(&format!("; filename=\"{file_name}\""));
    }
    let mut headers = HttpHeaders::new();
    headers.add("Content-Disposition", disposition);
    if let Some(mime) = mime_type {
        headers.add("Content-Type", mime);
    }
    headers
}

fn mime_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "json" => "application/json",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}
