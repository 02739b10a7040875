//! Ordered, case-insensitive header storage.

use std::fmt;

/// A single HTTP header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

impl HttpHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn accept(value: impl Into<String>) -> Self {
        Self::new("Accept", value)
    }

    pub fn authorization(value: impl Into<String>) -> Self {
        Self::new("Authorization", value)
    }

    pub fn authorization_bearer(token: &str) -> Self {
        Self::authorization(format!("Bearer {token}"))
    }

    pub fn content_type(value: impl Into<String>) -> Self {
        Self::new("Content-Type", value)
    }

    pub fn user_agent(value: impl Into<String>) -> Self {
        Self::new("User-Agent", value)
    }
}

impl fmt::Display for HttpHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// Header collection. Names compare case-insensitively; insertion order is
/// kept and a name appears at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpHeaders {
    headers: Vec<HttpHeader>,
}

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header, replacing the value of an existing header with the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.update(HttpHeader::new(name, value));
    }

    pub fn update(&mut self, header: HttpHeader) {
        match self.position(&header.name) {
            Some(idx) => self.headers[idx] = header,
            None => self.headers.push(header),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<HttpHeader> {
        self.position(name).map(|idx| self.headers.remove(idx))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|idx| self.headers[idx].value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Merge `other` into `self`; headers in `other` win.
    pub fn merge(&mut self, other: &HttpHeaders) {
        for header in other.iter() {
            self.update(header.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &HttpHeader> {
        self.headers.iter()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| h.name.eq_ignore_ascii_case(name))
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HttpHeaders {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = HttpHeaders::new();
        for (name, value) in iter {
            headers.add(name, value);
        }
        headers
    }
}

impl FromIterator<HttpHeader> for HttpHeaders {
    fn from_iter<I: IntoIterator<Item = HttpHeader>>(iter: I) -> Self {
        let mut headers = HttpHeaders::new();
        for header in iter {
            headers.update(header);
        }
        headers
    }
}

impl<'a> IntoIterator for &'a HttpHeaders {
    type Item = &'a HttpHeader;
    type IntoIter = std::slice::Iter<'a, HttpHeader>;

    fn into_iter(self) -> Self::IntoIter {
        self.headers.iter()
    }
}
