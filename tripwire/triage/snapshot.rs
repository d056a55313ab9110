use std::net::SocketAddr;

use axum::http::{header, HeaderMap, Method, Uri};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use serde_json::{Map, Value};

/// Header consulted first for the client address. Client supplied, so only a hint.
const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";
const UNKNOWN_SOURCE: &str = "unknown";

/// Immutable projection of one inbound request.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RequestSnapshot {
    method: String,
    url: String,
    path: String,
    source_address: String,
    payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    structured: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query: Option<Value>,
}

impl RequestSnapshot {
    /// Starts a snapshot for `method` and `url` (path plus optional query).
    #[must_use]
    pub fn builder(method: impl Into<String>, url: impl Into<String>) -> SnapshotBuilder {
        SnapshotBuilder {
            method: method.into(),
            url: url.into(),
            source: None,
            content_type: None,
            body: Vec::new(),
        }
    }

    /// Captures a snapshot from HTTP request parts and an already-buffered body.
    #[must_use]
    pub fn capture(
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
        body: &[u8],
    ) -> Self {
        let url = uri
            .path_and_query()
            .map_or_else(|| uri.path().to_owned(), ToString::to_string);
        let mut builder = Self::builder(method.as_str(), url).body(body);
        if let Some(source) = source_from_headers(headers).or_else(|| peer.map(|p| p.ip().to_string()))
        {
            builder = builder.source(source);
        }
        if let Some(content_type) = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            builder = builder.content_type(content_type);
        }
        builder.build()
    }

    /// HTTP method, upper-case.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Path plus query exactly as received.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Path without the query.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Best-effort client address; `unknown` when nothing was available.
    #[must_use]
    pub fn source_address(&self) -> &str {
        &self.source_address
    }

    /// Normalized payload: the URL for read-only methods, the body otherwise.
    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Key/value view of the payload (JSON object, form body or decoded query), if any.
    #[must_use]
    pub const fn structured(&self) -> Option<&Value> {
        self.structured.as_ref()
    }

    /// Percent-decoded query parameters, whatever the method.
    #[must_use]
    pub const fn query(&self) -> Option<&Value> {
        self.query.as_ref()
    }
}

/// Assembles a [`RequestSnapshot`]; used by the middleware and by tests.
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    method: String,
    url: String,
    source: Option<String>,
    content_type: Option<String>,
    body: Vec<u8>,
}

impl SnapshotBuilder {
    /// Sets the client address.
    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets the body media type.
    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Sets the raw body.
    #[must_use]
    pub fn body(mut self, body: impl AsRef<[u8]>) -> Self {
        self.body = body.as_ref().to_vec();
        self
    }

    /// Normalizes the collected parts.
    #[must_use]
    pub fn build(self) -> RequestSnapshot {
        let method = self.method.to_ascii_uppercase();
        let (path, query) = match self.url.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query)),
            None => (self.url.clone(), None),
        };
        let query = query.map(decode_form).filter(has_entries);
        let (payload, structured) = if is_read_only(&method) || self.body.is_empty() {
            (self.url.clone(), query.clone())
        } else {
            let payload = String::from_utf8_lossy(&self.body).into_owned();
            let structured = structured_body(self.content_type.as_deref(), &payload);
            (payload, structured)
        };
        RequestSnapshot {
            method,
            path,
            source_address: self
                .source
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| UNKNOWN_SOURCE.to_owned()),
            url: self.url,
            payload,
            structured,
            query,
        }
    }
}

fn is_read_only(method: &str) -> bool {
    matches!(method, "GET" | "HEAD" | "OPTIONS" | "TRACE")
}

fn source_from_headers(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    forwarded
        .or_else(|| {
            headers
                .get(REAL_IP)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        })
        .map(str::to_owned)
}

fn structured_body(content_type: Option<&str>, body: &str) -> Option<Value> {
    let media = content_type
        .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .unwrap_or_default();
    let looks_like_json = body.trim_start().starts_with(['{', '[']);
    if media == "application/json" || media.ends_with("+json") || (media.is_empty() && looks_like_json)
    {
        return serde_json::from_str::<Value>(body)
            .ok()
            .filter(|v| v.is_object() || v.is_array());
    }
    if media == "application/x-www-form-urlencoded" {
        return Some(decode_form(body)).filter(has_entries);
    }
    None
}

fn has_entries(value: &Value) -> bool {
    value.as_object().is_some_and(|map| !map.is_empty())
}

/// Decodes `a=1&b=2` pairs; repeated keys collect into an array.
fn decode_form(raw: &str) -> Value {
    let mut map = Map::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode_component(key);
        let value = Value::String(decode_component(value));
        match map.get_mut(&key) {
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                map.insert(key, value);
            }
        }
    }
    Value::Object(map)
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn read_only_methods_use_the_url_as_payload() {
        let snapshot = RequestSnapshot::builder("get", "/search?q=%3Cscript%3E&page=2")
            .body("ignored")
            .build();
        assert_eq!(snapshot.method(), "GET");
        assert_eq!(snapshot.path(), "/search");
        assert_eq!(snapshot.payload(), "/search?q=%3Cscript%3E&page=2");
        assert_eq!(
            snapshot.structured(),
            Some(&json!({ "q": "<script>", "page": "2" }))
        );
    }

    #[test]
    fn bodies_become_the_payload_for_writes() {
        let snapshot = RequestSnapshot::builder("POST", "/login")
            .content_type("application/x-www-form-urlencoded")
            .body("user=admin&note=hello+world&note=again")
            .build();
        assert_eq!(snapshot.payload(), "user=admin&note=hello+world&note=again");
        assert_eq!(
            snapshot.structured(),
            Some(&json!({ "user": "admin", "note": ["hello world", "again"] }))
        );
    }

    #[test]
    fn query_is_decoded_for_writes_too() {
        let snapshot = RequestSnapshot::builder("POST", "/echo?q=%3Cscript%3E")
            .content_type("application/x-www-form-urlencoded")
            .body("a=b")
            .build();
        assert_eq!(snapshot.structured(), Some(&json!({ "a": "b" })));
        assert_eq!(snapshot.query(), Some(&json!({ "q": "<script>" })));
    }

    #[test]
    fn empty_write_body_falls_back_to_url() {
        let snapshot = RequestSnapshot::builder("DELETE", "/items/7").build();
        assert_eq!(snapshot.payload(), "/items/7");
        assert!(snapshot.structured().is_none());
    }

    #[test]
    fn json_bodies_are_structured_even_without_content_type() {
        let snapshot = RequestSnapshot::builder("PUT", "/profile")
            .body(r#"{"bio":{"text":"hi"}}"#)
            .build();
        assert_eq!(snapshot.structured(), Some(&json!({"bio": {"text": "hi"}})));

        let plain = RequestSnapshot::builder("PUT", "/profile")
            .content_type("text/plain")
            .body(r#"{"bio":"hi"}"#)
            .build();
        assert!(plain.structured().is_none());
    }

    #[test]
    fn capture_prefers_forwarded_headers_over_peer() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR,
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let uri: Uri = "/a?b=c".parse().unwrap();
        let snapshot = RequestSnapshot::capture(&Method::GET, &uri, &headers, Some(peer), b"");
        assert_eq!(snapshot.source_address(), "203.0.113.9");
        assert_eq!(snapshot.url(), "/a?b=c");

        let bare = RequestSnapshot::capture(&Method::GET, &uri, &HeaderMap::new(), Some(peer), b"");
        assert_eq!(bare.source_address(), "127.0.0.1");

        let nothing = RequestSnapshot::capture(&Method::GET, &uri, &HeaderMap::new(), None, b"");
        assert_eq!(nothing.source_address(), "unknown");
    }
}
