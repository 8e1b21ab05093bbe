use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Map, Value};
use strand_h2::HeaderField;
use url::Url;

use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::event::{Event, EventKind, Events};
use crate::query;

/// One call: method, target, headers, body and timeout.
///
/// Header names are stored lowercase. [`headers`](Request::headers)
/// computes what actually goes on the wire.
#[derive(Debug)]
pub struct Request {
    method: String,
    uri: Url,
    path: String,
    params: Map<String, Value>,
    headers: BTreeMap<String, String>,
    body: Option<Bytes>,
    timeout: Duration,
    events: Events,
}

impl Request {
    /// A request for `path` on the host `uri` points at. The method is
    /// uppercased; an empty path becomes `/`.
    pub fn new(method: &str, uri: &Url, path: &str) -> Self {
        let path = if path.is_empty() {
            "/".to_string()
        } else if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Self {
            method: method.to_ascii_uppercase(),
            uri: uri.clone(),
            path,
            params: Map::new(),
            headers: BTreeMap::new(),
            body: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            events: Events::new(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// A header as set by the caller (not the computed wire headers).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers.remove(&name.to_ascii_lowercase())
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) -> &mut Self {
        self.body = Some(body.into());
        self
    }

    pub fn clear_body(&mut self) -> &mut Self {
        self.body = None;
        self
    }

    pub fn set_param(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    /// Register a lifecycle handler; see [`Event`].
    pub fn on<F>(&mut self, kind: EventKind, handler: F) -> &mut Self
    where
        F: FnMut(&Event<'_>) + Send + 'static,
    {
        self.events.on(kind, handler);
        self
    }

    /// Run the handlers registered for `event`'s kind, in registration order.
    /// Once sent, a request's handlers belong to its stream.
    pub fn emit(&mut self, event: &Event<'_>) {
        self.events.emit(event);
    }

    /// Path plus the encoded query params, appended to any query string
    /// the path already carries.
    pub fn full_path(&self) -> String {
        let query = query::encode(&self.params);
        if query.is_empty() {
            self.path.clone()
        } else if self.path.contains('?') {
            format!("{}&{query}", self.path)
        } else {
            format!("{}?{query}", self.path)
        }
    }

    /// `host`, or `host:port` when the URI names a non-default port.
    pub fn authority(&self) -> String {
        let host = self.uri.host_str().unwrap_or_default();
        match self.uri.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// The headers to send: the caller's headers with the pseudo-headers
    /// overwritten and `content-length` matching the body. Without a body
    /// there is never a `content-length`.
    pub fn headers(&self) -> BTreeMap<String, String> {
        let mut headers = self.headers.clone();
        headers.insert(":scheme".into(), self.uri.scheme().to_string());
        headers.insert(":method".into(), self.method.clone());
        headers.insert(":path".into(), self.full_path());
        headers.insert(":authority".into(), self.authority());
        match &self.body {
            Some(body) => {
                headers.insert("content-length".into(), body.len().to_string());
            }
            None => {
                headers.remove("content-length");
            }
        }
        headers
    }

    pub(crate) fn header_fields(&self) -> Vec<HeaderField> {
        self.headers()
            .into_iter()
            .map(|(name, value)| HeaderField::new(name, value))
            .collect()
    }

    pub(crate) fn take_events(&mut self) -> Events {
        std::mem::take(&mut self.events)
    }
}

/// Per-call knobs for [`Client::call`](crate::Client::call) and friends.
///
/// ```rust
/// use std::time::Duration;
/// use strand::CallOptions;
///
/// let options = CallOptions::new()
///     .header("accept", "application/json")
///     .param("page", 2)
///     .timeout(Duration::from_secs(5));
/// ```
#[derive(Debug, Default)]
pub struct CallOptions {
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub params: Map<String, Value>,
    /// Overrides the client's request timeout.
    pub timeout: Option<Duration>,
    pub events: Events,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on<F>(mut self, kind: EventKind, handler: F) -> Self
    where
        F: FnMut(&Event<'_>) + Send + 'static,
    {
        self.events.on(kind, handler);
        self
    }

    pub(crate) fn apply(self, request: &mut Request) {
        for (name, value) in self.headers {
            request.set_header(&name, value);
        }
        if let Some(body) = self.body {
            request.set_body(body);
        }
        request.params.extend(self.params);
        if let Some(timeout) = self.timeout {
            request.set_timeout(timeout);
        }
        request.events = self.events;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn request(method: &str, uri: &str, path: &str) -> Request {
        Request::new(method, &Url::parse(uri).unwrap(), path)
    }

    #[test]
    fn pseudo_headers_are_always_set() {
        let mut req = request("get", "https://example.com", "/items");
        req.set_header(":method", "DELETE").set_header(":path", "/other");
        let headers = req.headers();
        assert_eq!(headers[":method"], "GET");
        assert_eq!(headers[":scheme"], "https");
        assert_eq!(headers[":path"], "/items");
        assert_eq!(headers[":authority"], "example.com");
    }

    #[test]
    fn authority_keeps_explicit_port() {
        let req = request("GET", "http://127.0.0.1:8080", "/");
        assert_eq!(req.headers()[":authority"], "127.0.0.1:8080");
        assert_eq!(req.headers()[":scheme"], "http");
    }

    #[test]
    fn no_body_means_no_content_length() {
        let mut req = request("POST", "https://example.com", "/");
        req.set_header("Content-Length", "42");
        assert!(!req.headers().contains_key("content-length"));
    }

    #[test]
    fn body_length_overrides_content_length() {
        let mut req = request("POST", "https://example.com", "/");
        req.set_header("content-length", "1").set_body("hello");
        assert_eq!(req.headers()["content-length"], "5");

        req.set_body(Bytes::new());
        assert_eq!(req.headers()["content-length"], "0");

        req.clear_body();
        assert!(!req.headers().contains_key("content-length"));
    }

    #[test]
    fn headers_are_idempotent() {
        let mut req = request("PUT", "https://example.com", "/a");
        req.set_header("X-Trace", "1").set_body("x").set_param("q", "v");
        assert_eq!(req.headers(), req.headers());
        assert_eq!(req.header("x-trace"), Some("1"));
    }

    #[test]
    fn host_header_is_passed_through() {
        let mut req = request("GET", "https://example.com", "/");
        req.set_header("Host", "other.example");
        let headers = req.headers();
        assert_eq!(headers["host"], "other.example");
        assert_eq!(headers[":authority"], "example.com");
    }

    #[test]
    fn full_path_appends_params() {
        let mut req = request("GET", "https://example.com", "search");
        assert_eq!(req.path(), "/search");
        req.set_param("q", "rust lang").set_param("filter", json!({ "lang": ["en", "de"] }));
        assert_eq!(
            req.full_path(),
            "/search?filter%5Blang%5D%5B%5D=en&filter%5Blang%5D%5B%5D=de&q=rust+lang"
        );

        let mut req = request("GET", "https://example.com", "/search?x=1");
        req.set_param("y", 2);
        assert_eq!(req.full_path(), "/search?x=1&y=2");
        assert_eq!(req.headers()[":path"], "/search?x=1&y=2");
    }

    #[test]
    fn empty_path_is_root() {
        assert_eq!(request("GET", "https://example.com", "").full_path(), "/");
    }

    #[test]
    fn options_apply() {
        let mut req = request("POST", "https://example.com", "/");
        CallOptions::new()
            .header("X-A", "1")
            .body("abc")
            .param("k", true)
            .timeout(Duration::from_millis(250))
            .on(EventKind::Close, |_| {})
            .apply(&mut req);
        assert_eq!(req.header("x-a"), Some("1"));
        assert_eq!(req.body().map(|b| b.len()), Some(3));
        assert_eq!(req.full_path(), "/?k=true");
        assert_eq!(req.timeout(), Duration::from_millis(250));
        assert!(req.take_events().has(EventKind::Close));
    }

    #[test]
    fn emit_runs_matching_handlers() {
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let s = seen.clone();
        let mut req = request("GET", "https://example.com", "/");
        req.on(EventKind::BodyChunk, move |e| {
            if let Event::BodyChunk(chunk) = e {
                s.fetch_add(chunk.len(), std::sync::atomic::Ordering::SeqCst);
            }
        });
        req.emit(&Event::BodyChunk(b"abc"));
        req.emit(&Event::Close(None));
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
