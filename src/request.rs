//! Incoming HTTP request type.

use bytes::Bytes;
use http::{HeaderMap, Method, Uri, Version};

use crate::enrich::REQUEST_ID;

/// An incoming HTTP request, after enrichment.
///
/// By the time a handler or middleware sees a `Request`:
/// - the `request-id` header is set (client supplied or generated),
/// - matched path parameters have been merged into the query string.
pub struct Request {
    pub(crate) head: RequestHead,
    pub(crate) body: Bytes,
    pub(crate) query: Vec<(String, String)>,
}

impl Request {
    pub(crate) fn new(head: RequestHead, body: Bytes) -> Self {
        let query = head.uri.query().map(parse_query).unwrap_or_default();
        Self { head, body, query }
    }

    pub fn method(&self) -> &Method { &self.head.method }
    pub fn uri(&self) -> &Uri { &self.head.uri }
    pub fn path(&self) -> &str { self.head.uri.path() }
    pub fn headers(&self) -> &HeaderMap { &self.head.headers }
    pub fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.head.headers }
    pub fn body(&self) -> &[u8] { &self.body }

    /// Header lookup. Names are case-insensitive; non UTF-8 values read as `None`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The correlation id assigned to this request.
    pub fn request_id(&self) -> &str {
        self.header(REQUEST_ID).unwrap_or_default()
    }

    /// First value of a query parameter.
    ///
    /// Path parameters are merged into the query under their pattern names,
    /// after any values the client sent. For a route `/item/:id`,
    /// `req.query("id")` on `/item/42` returns `Some("42")`; on
    /// `/item/42?id=7` it returns `Some("7")`. Use [`Request::query_all`]
    /// to see both.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Every value of a query parameter, in order: client values first,
    /// then the path parameter of the same name.
    pub fn query_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.query.iter().filter(move |(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// A copy of the request line and headers.
    pub fn head(&self) -> &RequestHead { &self.head }
}

/// Request line and headers, without the body.
///
/// Handed to the [`PanicHandler`](crate::PanicHandler) because the request
/// itself was consumed by the handler that panicked.
#[derive(Clone, Debug)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl From<http::request::Parts> for RequestHead {
    fn from(parts: http::request::Parts) -> Self {
        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
        }
    }
}

pub(crate) fn parse_query(raw: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(raw.as_bytes()).into_owned().collect()
}
