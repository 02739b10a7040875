//! Turning raw response bytes into typed values.
//!
//! Every serializer follows the same steps: an upstream error is returned
//! unchanged, empty bodies are accepted only for the status codes and methods
//! in its [`EmptyPolicy`] (and then produce a canonical empty value), and
//! anything else is converted by the serializer itself.

use std::any::type_name;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};
use serde::de::value::{Error as ValueError, MapDeserializer, SeqDeserializer};
use serde::de::{self, DeserializeOwned, Deserializer, Visitor};
use serde_json::Value;

use super::ResponseMetadata;
use crate::error::{BoxError, Error, ResponseSerializationFailure, Result};
use crate::method::HttpMethod;
use crate::url_request::UrlRequest;

fn failure(reason: ResponseSerializationFailure) -> Error {
    Error::ResponseSerializationFailed(reason)
}

/// Converts the raw parts of a finished request into `Output`.
pub trait ResponseSerializer: Send + Sync + 'static {
    type Output: Send + 'static;

    fn serialize(
        &self,
        request: Option<&UrlRequest>,
        response: Option<&ResponseMetadata>,
        data: Option<&Bytes>,
        error: Option<&Error>,
    ) -> Result<Self::Output>;

    /// Read a downloaded file, then serialize its contents.
    fn serialize_download(
        &self,
        request: Option<&UrlRequest>,
        response: Option<&ResponseMetadata>,
        file_url: Option<&Path>,
        error: Option<&Error>,
    ) -> Result<Self::Output> {
        if let Some(error) = error {
            return Err(error.clone());
        }
        let path = file_url.ok_or_else(|| failure(ResponseSerializationFailure::InputFileNil))?;
        let data = std::fs::read(path).map_err(|e| {
            failure(ResponseSerializationFailure::InputFileReadFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        })?;
        self.serialize(request, response, Some(&Bytes::from(data)), None)
    }
}

// ── Empty responses ────────────────────────────────────────────────

/// Status codes and methods for which an empty body is acceptable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmptyPolicy {
    pub codes: HashSet<u16>,
    pub methods: HashSet<HttpMethod>,
}

impl Default for EmptyPolicy {
    fn default() -> Self {
        Self {
            codes: [204, 205].into_iter().collect(),
            methods: [HttpMethod::Head].into_iter().collect(),
        }
    }
}

impl EmptyPolicy {
    pub fn allows(
        &self,
        request: Option<&UrlRequest>,
        response: Option<&ResponseMetadata>,
    ) -> bool {
        request.is_some_and(|r| self.methods.contains(&r.method))
            || response.is_some_and(|r| self.codes.contains(&r.status))
    }
}

/// Shared prologue: `Ok(None)` when the body is an acceptable empty body,
/// `Ok(Some(data))` when there is something to convert.
fn prepare<'a>(
    policy: &EmptyPolicy,
    request: Option<&UrlRequest>,
    response: Option<&ResponseMetadata>,
    data: Option<&'a Bytes>,
    error: Option<&Error>,
) -> Result<Option<&'a Bytes>> {
    if let Some(error) = error {
        return Err(error.clone());
    }
    match data {
        Some(data) if !data.is_empty() => Ok(Some(data)),
        _ if policy.allows(request, response) => Ok(None),
        _ => Err(failure(ResponseSerializationFailure::InputDataNilOrZeroLength)),
    }
}

// ── Data ───────────────────────────────────────────────────────────

/// Passes the body through unchanged.
#[derive(Debug, Clone, Default)]
pub struct DataResponseSerializer {
    pub empty: EmptyPolicy,
}

impl ResponseSerializer for DataResponseSerializer {
    type Output = Bytes;

    fn serialize(
        &self,
        request: Option<&UrlRequest>,
        response: Option<&ResponseMetadata>,
        data: Option<&Bytes>,
        error: Option<&Error>,
    ) -> Result<Bytes> {
        Ok(prepare(&self.empty, request, response, data, error)?
            .cloned()
            .unwrap_or_default())
    }
}

// ── String ─────────────────────────────────────────────────────────

/// Decodes the body as text.
///
/// The encoding is, in order: the one set on the serializer, the response's
/// declared charset, UTF-8.
#[derive(Debug, Clone, Default)]
pub struct StringResponseSerializer {
    pub encoding: Option<&'static Encoding>,
    pub empty: EmptyPolicy,
}

impl StringResponseSerializer {
    pub fn with_encoding(encoding: &'static Encoding) -> Self {
        Self {
            encoding: Some(encoding),
            ..Default::default()
        }
    }

    /// Resolve a WHATWG encoding label such as `"iso-8859-1"`.
    pub fn with_encoding_label(label: &str) -> Option<Self> {
        Encoding::for_label(label.trim().as_bytes()).map(Self::with_encoding)
    }

    fn resolve(&self, response: Option<&ResponseMetadata>) -> &'static Encoding {
        self.encoding
            .or_else(|| {
                response
                    .and_then(ResponseMetadata::charset)
                    .and_then(|label| Encoding::for_label(label.as_bytes()))
            })
            .unwrap_or(UTF_8)
    }
}

impl ResponseSerializer for StringResponseSerializer {
    type Output = String;

    fn serialize(
        &self,
        request: Option<&UrlRequest>,
        response: Option<&ResponseMetadata>,
        data: Option<&Bytes>,
        error: Option<&Error>,
    ) -> Result<String> {
        let Some(data) = prepare(&self.empty, request, response, data, error)? else {
            return Ok(String::new());
        };
        let encoding = self.resolve(response);
        encoding
            .decode_without_bom_handling_and_without_replacement(data)
            .map(|text| text.into_owned())
            .ok_or_else(|| {
                failure(ResponseSerializationFailure::StringSerializationFailed {
                    encoding: encoding.name(),
                })
            })
    }
}

// ── JSON ───────────────────────────────────────────────────────────

/// Parses the body into an untyped [`serde_json::Value`]. Empty is `Null`.
#[derive(Debug, Clone, Default)]
pub struct JsonResponseSerializer {
    pub empty: EmptyPolicy,
}

impl ResponseSerializer for JsonResponseSerializer {
    type Output = Value;

    fn serialize(
        &self,
        request: Option<&UrlRequest>,
        response: Option<&ResponseMetadata>,
        data: Option<&Bytes>,
        error: Option<&Error>,
    ) -> Result<Value> {
        let Some(data) = prepare(&self.empty, request, response, data, error)? else {
            return Ok(Value::Null);
        };
        serde_json::from_slice(data).map_err(|e| {
            failure(ResponseSerializationFailure::JsonSerializationFailed(Arc::new(e)))
        })
    }
}

// ── Decodable ──────────────────────────────────────────────────────

/// Format-specific decoding used by [`DecodableResponseSerializer`].
pub trait DataDecoder: Send + Sync + 'static {
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> std::result::Result<T, BoxError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl DataDecoder for JsonDecoder {
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> std::result::Result<T, BoxError> {
        serde_json::from_slice(data).map_err(|e| Arc::new(e) as BoxError)
    }
}

/// Decodes the body into any `DeserializeOwned` type.
///
/// An acceptable empty body decodes to the type's canonical empty value:
/// `""` for strings, empty sequences and maps, `None`, and `()`. Other types
/// fail with [`ResponseSerializationFailure::InvalidEmptyResponse`].
pub struct DecodableResponseSerializer<T, D = JsonDecoder> {
    pub decoder: D,
    pub empty: EmptyPolicy,
    _output: PhantomData<fn() -> T>,
}

impl<T> Default for DecodableResponseSerializer<T, JsonDecoder> {
    fn default() -> Self {
        Self::with_decoder(JsonDecoder)
    }
}

impl<T, D> DecodableResponseSerializer<T, D> {
    pub fn with_decoder(decoder: D) -> Self {
        Self {
            decoder,
            empty: EmptyPolicy::default(),
            _output: PhantomData,
        }
    }

    pub fn with_empty_policy(mut self, empty: EmptyPolicy) -> Self {
        self.empty = empty;
        self
    }
}

impl<T, D> ResponseSerializer for DecodableResponseSerializer<T, D>
where
    T: DeserializeOwned + Send + 'static,
    D: DataDecoder,
{
    type Output = T;

    fn serialize(
        &self,
        request: Option<&UrlRequest>,
        response: Option<&ResponseMetadata>,
        data: Option<&Bytes>,
        error: Option<&Error>,
    ) -> Result<T> {
        let Some(data) = prepare(&self.empty, request, response, data, error)? else {
            return T::deserialize(EmptyValue).map_err(|_| {
                failure(ResponseSerializationFailure::InvalidEmptyResponse {
                    type_name: type_name::<T>(),
                })
            });
        };
        self.decoder
            .decode(data)
            .map_err(|e| failure(ResponseSerializationFailure::DecodingFailed(e)))
    }
}

/// Deserializer that yields the canonical empty value for the requested
/// shape and rejects shapes that have none.
struct EmptyValue;

impl<'de> Deserializer<'de> for EmptyValue {
    type Error = ValueError;

    fn deserialize_any<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, ValueError> {
        Err(de::Error::custom("type has no empty value"))
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ValueError> {
        visitor.visit_borrowed_str("")
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ValueError> {
        visitor.visit_borrowed_str("")
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ValueError> {
        visitor.visit_borrowed_bytes(&[])
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ValueError> {
        visitor.visit_borrowed_bytes(&[])
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ValueError> {
        visitor.visit_none()
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ValueError> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, ValueError> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, ValueError> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ValueError> {
        visitor.visit_seq(SeqDeserializer::<_, ValueError>::new(std::iter::empty::<()>()))
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, ValueError> {
        visitor.visit_map(MapDeserializer::<_, ValueError>::new(
            std::iter::empty::<((), ())>(),
        ))
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char
        tuple tuple_struct struct enum identifier ignored_any
    }
}
