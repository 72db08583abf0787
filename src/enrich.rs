//! Per-request enrichment: correlation id and path-parameter merging.
//!
//! Runs before the composed handler sees the request. Path parameters are
//! percent-decoded once and exposed as ordinary query values, appended after
//! whatever the client sent.
//! A client query value with the same name as a path parameter therefore
//! comes first; [`Request::query_all`](crate::Request::query_all) returns both.

use std::time::Instant;

use http::header::HeaderValue;
use http::uri::{PathAndQuery, Uri};
use http::HeaderMap;
use percent_encoding::percent_decode_str;

pub(crate) const REQUEST_ID: &str = "request-id";
pub(crate) const X_REQUEST_ID: &str = "x-request-id";

/// State owned by the single task serving one request.
pub(crate) struct RequestContext {
    pub(crate) request_id: HeaderValue,
    pub(crate) started: Instant,
}

impl RequestContext {
    pub(crate) fn new(headers: &mut HeaderMap, started: Instant) -> Self {
        Self { request_id: assign_request_id(headers), started }
    }

    pub(crate) fn request_id(&self) -> &str {
        self.request_id.to_str().unwrap_or_default()
    }
}

/// Resolves the request id, writing it back into `request-id`.
///
/// An existing `request-id` wins; otherwise `x-request-id` is copied over;
/// otherwise a fresh UUID v4 is generated. Empty values count as absent.
pub(crate) fn assign_request_id(headers: &mut HeaderMap) -> HeaderValue {
    if let Some(id) = present(headers, REQUEST_ID) {
        return id;
    }

    let id = present(headers, X_REQUEST_ID).unwrap_or_else(|| {
        // A hyphenated UUID is always a valid header value.
        HeaderValue::from_str(&uuid::Uuid::new_v4().to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("-"))
    });
    headers.insert(REQUEST_ID, id.clone());
    id
}

/// Empty or non-text values count as absent.
fn present(headers: &HeaderMap, name: &str) -> Option<HeaderValue> {
    headers
        .get(name)
        .filter(|v| !v.is_empty() && v.to_str().is_ok())
        .cloned()
}

/// Decodes `%XX` escapes in captured path segments. `+` is literal in a path.
pub(crate) fn decode_params(params: Vec<(String, String)>) -> Vec<(String, String)> {
    params
        .into_iter()
        .map(|(name, raw)| {
            let value = percent_decode_str(&raw).decode_utf8_lossy().into_owned();
            (name, value)
        })
        .collect()
}

/// Appends `params` to the query string of `uri`.
///
/// The URI is returned unchanged when there is nothing to merge.
pub(crate) fn merge_params(uri: Uri, params: &[(String, String)]) -> Uri {
    if params.is_empty() {
        return uri;
    }

    let mut query = url::form_urlencoded::Serializer::new(String::new());
    if let Some(existing) = uri.query() {
        query.extend_pairs(url::form_urlencoded::parse(existing.as_bytes()));
    }
    query.extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    let merged = format!("{}?{}", uri.path(), query.finish());

    let mut parts = uri.into_parts();
    match PathAndQuery::try_from(merged) {
        Ok(pq) => parts.path_and_query = Some(pq),
        Err(e) => tracing::warn!(error = %e, "could not merge path parameters into query"),
    }
    Uri::from_parts(parts).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "rebuilt request uri is invalid");
        Uri::default()
    })
}
