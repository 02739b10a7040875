use bytes::Bytes;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::Value;

use super::{FORM_CONTENT_TYPE, ParameterEncoding, Parameters};
use crate::error::Result;
use crate::method::HttpMethod;
use crate::url_request::UrlRequest;

/// Characters left unescaped in query keys and values: RFC 3986 unreserved
/// characters plus `/` and `?`. General and sub-delimiters are escaped.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/')
    .remove(b'?');

/// Where URL-encoded parameters are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
    /// Query string for `GET`, `HEAD` and `DELETE`, body otherwise.
    #[default]
    MethodDependent,
    QueryString,
    HttpBody,
}

impl Destination {
    pub(crate) fn encodes_in_url(self, method: HttpMethod) -> bool {
        match self {
            Destination::MethodDependent => method.encodes_parameters_in_url(),
            Destination::QueryString => true,
            Destination::HttpBody => false,
        }
    }
}

/// How array values are keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArrayEncoding {
    /// `key[]=a&key[]=b`
    #[default]
    Brackets,
    /// `key=a&key=b`
    NoBrackets,
    /// `key[0]=a&key[1]=b`
    IndexInBrackets,
}

impl ArrayEncoding {
    fn encode(self, key: &str, index: usize) -> String {
        match self {
            ArrayEncoding::Brackets => format!("{key}[]"),
            ArrayEncoding::NoBrackets => key.to_string(),
            ArrayEncoding::IndexInBrackets => format!("{key}[{index}]"),
        }
    }
}

/// How booleans are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoolEncoding {
    /// `1` / `0`
    #[default]
    Numeric,
    /// `true` / `false`
    Literal,
}

impl BoolEncoding {
    fn encode(self, value: bool) -> &'static str {
        match (self, value) {
            (BoolEncoding::Numeric, true) => "1",
            (BoolEncoding::Numeric, false) => "0",
            (BoolEncoding::Literal, true) => "true",
            (BoolEncoding::Literal, false) => "false",
        }
    }
}

/// `application/x-www-form-urlencoded` parameter encoding.
///
/// Keys are emitted in sorted order; nested objects become `key[nested]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UrlEncoding {
    pub destination: Destination,
    pub array_encoding: ArrayEncoding,
    pub bool_encoding: BoolEncoding,
}

impl UrlEncoding {
    pub fn query_string() -> Self {
        Self {
            destination: Destination::QueryString,
            ..Default::default()
        }
    }

    pub fn http_body() -> Self {
        Self {
            destination: Destination::HttpBody,
            ..Default::default()
        }
    }

    pub fn with_array_encoding(mut self, encoding: ArrayEncoding) -> Self {
        self.array_encoding = encoding;
        self
    }

    pub fn with_bool_encoding(mut self, encoding: BoolEncoding) -> Self {
        self.bool_encoding = encoding;
        self
    }

    /// Build the percent-encoded `k=v&...` string for `parameters`.
    pub fn query(&self, parameters: &Parameters) -> String {
        let mut components = Vec::new();
        for (key, value) in sorted(parameters) {
            self.query_components(key, value, &mut components);
        }
        components
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn query_components(&self, key: &str, value: &Value, out: &mut Vec<(String, String)>) {
        match value {
            Value::Object(map) => {
                for (nested_key, nested) in sorted(map) {
                    self.query_components(&format!("{key}[{nested_key}]"), nested, out);
                }
            }
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    self.query_components(&self.array_encoding.encode(key, index), item, out);
                }
            }
            Value::Bool(b) => out.push((escape(key), self.bool_encoding.encode(*b).to_string())),
            Value::String(s) => out.push((escape(key), escape(s))),
            Value::Number(n) => out.push((escape(key), escape(&n.to_string()))),
            Value::Null => out.push((escape(key), String::new())),
        }
    }

    /// Place an already-built query string according to the destination.
    pub(crate) fn apply(&self, mut request: UrlRequest, query: String) -> UrlRequest {
        if self.destination.encodes_in_url(request.method) {
            if !query.is_empty() {
                let combined = match request.url.query() {
                    Some(existing) if !existing.is_empty() => format!("{existing}&{query}"),
                    _ => query,
                };
                request.url.set_query(Some(&combined));
            }
        } else {
            request.set_header_if_absent("Content-Type", FORM_CONTENT_TYPE);
            request.body = Some(Bytes::from(query));
        }
        request
    }
}

impl ParameterEncoding for UrlEncoding {
    fn encode(&self, request: UrlRequest, parameters: Option<&Parameters>) -> Result<UrlRequest> {
        let Some(parameters) = parameters else {
            return Ok(request);
        };
        let query = self.query(parameters);
        Ok(self.apply(request, query))
    }
}

fn sorted(map: &Parameters) -> Vec<(&String, &Value)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

fn escape(s: &str) -> String {
    utf8_percent_encode(s, QUERY_VALUE).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn params(value: Value) -> Parameters {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn query_string_round_trips_sorted() {
        let request = UrlRequest::get("https://example.com").unwrap();
        let encoded = UrlEncoding::query_string()
            .encode(request, Some(&params(json!({"foo": "bar", "baz": "qux"}))))
            .unwrap();

        assert_eq!(encoded.url.query(), Some("baz=qux&foo=bar"));
        let pairs: HashMap<String, String> = encoded.url.query_pairs().into_owned().collect();
        assert_eq!(pairs.get("foo").map(String::as_str), Some("bar"));
        assert_eq!(pairs.get("baz").map(String::as_str), Some("qux"));
        assert!(encoded.body.is_none());
    }

    #[test]
    fn appends_to_existing_query() {
        let request = UrlRequest::get("https://example.com/?page=2").unwrap();
        let encoded = UrlEncoding::default()
            .encode(request, Some(&params(json!({"q": "rust"}))))
            .unwrap();
        assert_eq!(encoded.url.query(), Some("page=2&q=rust"));
    }

    #[test]
    fn http_body_sets_form_content_type() {
        let request = UrlRequest::new("https://example.com", HttpMethod::Post).unwrap();
        let encoded = UrlEncoding::default()
            .encode(request, Some(&params(json!({"foo": "bar", "baz": "qux"}))))
            .unwrap();
        assert_eq!(encoded.body.as_deref(), Some(&b"baz=qux&foo=bar"[..]));
        assert_eq!(encoded.headers.get("Content-Type"), Some(FORM_CONTENT_TYPE));
        assert!(encoded.url.query().is_none());
    }

    #[test]
    fn existing_content_type_is_kept() {
        let mut request = UrlRequest::new("https://example.com", HttpMethod::Post).unwrap();
        request.headers.add("Content-Type", "text/plain");
        let encoded = UrlEncoding::http_body()
            .encode(request, Some(&params(json!({"a": 1}))))
            .unwrap();
        assert_eq!(encoded.headers.get("content-type"), Some("text/plain"));
    }

    #[test]
    fn nested_arrays_and_bools() {
        let encoding = UrlEncoding::default();
        let query = encoding.query(&params(json!({
            "tags": ["a", "b"],
            "user": {"name": "ann", "admin": true},
        })));
        assert_eq!(
            query,
            "tags%5B%5D=a&tags%5B%5D=b&user%5Badmin%5D=1&user%5Bname%5D=ann"
        );

        let literal = UrlEncoding::default()
            .with_array_encoding(ArrayEncoding::NoBrackets)
            .with_bool_encoding(BoolEncoding::Literal);
        assert_eq!(
            literal.query(&params(json!({"flag": false, "ids": [1, 2]}))),
            "flag=false&ids=1&ids=2"
        );
    }

    #[test]
    fn reserved_characters_are_escaped() {
        let query = UrlEncoding::default().query(&params(json!({"q": "a&b=c d", "path": "/x?y"})));
        assert_eq!(query, "path=/x?y&q=a%26b%3Dc%20d");
    }

    #[test]
    fn none_parameters_leave_request_untouched() {
        let request = UrlRequest::get("https://example.com/").unwrap();
        let encoded = UrlEncoding::default().encode(request.clone(), None).unwrap();
        assert_eq!(encoded, request);
    }
}
