//! Cross-origin resource sharing.
//!
//! [`Cors`] is plain configuration; at build time it becomes a tower-http
//! [`CorsLayer`] wrapped around the whole service, so preflight requests are
//! answered before routing and never reach a handler.

use std::time::Duration;

use http::header::{HeaderName, HeaderValue, ORIGIN};
use http::request::Parts;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer, ExposeHeaders};

use crate::error::ConfigError;

const DEFAULT_METHODS: [&str; 3] = ["GET", "POST", "HEAD"];
const DEFAULT_HEADERS: [&str; 4] = ["origin", "accept", "content-type", "x-requested-with"];

/// CORS policy.
///
/// Empty lists fall back to permissive defaults: every origin, `GET`,
/// `POST` and `HEAD`, and the `Origin`, `Accept`, `Content-Type` and
/// `X-Requested-With` request headers.
///
/// An origin may contain one `*`, e.g. `https://*.example.com`.
///
/// ```rust
/// use portico::Cors;
///
/// let cors = Cors::new()
///     .allow_origins(["https://app.example.com"])
///     .allow_methods(["GET", "PUT"])
///     .allow_credentials(true);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Cors {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub max_age: Option<Duration>,
    pub allow_credentials: bool,
    /// Emit a `debug` event for every request that carries an `Origin`.
    pub debug: bool,
}

impl Cors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins.extend(origins.into_iter().map(Into::into));
        self
    }

    pub fn allow_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_methods.extend(methods.into_iter().map(Into::into));
        self
    }

    pub fn allow_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_headers.extend(headers.into_iter().map(Into::into));
        self
    }

    pub fn expose_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exposed_headers.extend(headers.into_iter().map(Into::into));
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Validates the policy and turns it into a tower-http layer.
    ///
    /// Wildcards combined with credentials mirror the request instead, since
    /// browsers reject a literal `*` on credentialed requests.
    pub(crate) fn to_layer(&self) -> Result<CorsLayer, ConfigError> {
        let mut layer = CorsLayer::new()
            .allow_origin(self.origins()?)
            .allow_methods(self.methods()?)
            .allow_headers(self.request_headers()?)
            .allow_credentials(self.allow_credentials);

        if !self.exposed_headers.is_empty() {
            layer = layer.expose_headers(self.exposed()?);
        }
        if let Some(max_age) = self.max_age {
            layer = layer.max_age(max_age);
        }
        Ok(layer)
    }

    fn origins(&self) -> Result<AllowOrigin, ConfigError> {
        if self.allowed_origins.is_empty() || self.allowed_origins.iter().any(|o| o == "*") {
            return Ok(if self.allow_credentials {
                AllowOrigin::mirror_request()
            } else {
                AllowOrigin::any()
            });
        }

        let mut exact = Vec::new();
        let mut patterns = Vec::new();
        for origin in &self.allowed_origins {
            let origin = origin.to_ascii_lowercase();
            match origin.split_once('*') {
                Some((prefix, suffix)) if !suffix.contains('*') => {
                    patterns.push((prefix.to_owned(), suffix.to_owned()));
                }
                Some(_) => return Err(ConfigError::Cors(format!("origin {origin:?} has more than one wildcard"))),
                None => exact.push(parse_value(&origin)?),
            }
        }

        if patterns.is_empty() {
            return Ok(AllowOrigin::list(exact));
        }
        Ok(AllowOrigin::predicate(move |origin: &HeaderValue, _: &Parts| {
            exact.contains(origin)
                || origin.to_str().is_ok_and(|o| {
                    let o = o.to_ascii_lowercase();
                    patterns.iter().any(|(prefix, suffix)| {
                        o.len() >= prefix.len() + suffix.len()
                            && o.starts_with(prefix.as_str())
                            && o.ends_with(suffix.as_str())
                    })
                })
        }))
    }

    fn methods(&self) -> Result<AllowMethods, ConfigError> {
        if self.allowed_methods.iter().any(|m| m == "*") {
            return Ok(if self.allow_credentials {
                AllowMethods::mirror_request()
            } else {
                AllowMethods::any()
            });
        }

        let names: Vec<&str> = if self.allowed_methods.is_empty() {
            DEFAULT_METHODS.to_vec()
        } else {
            self.allowed_methods.iter().map(String::as_str).collect()
        };
        let methods = names
            .into_iter()
            .map(|m| {
                http::Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|_| ConfigError::Cors(format!("invalid method {m:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AllowMethods::list(methods))
    }

    fn request_headers(&self) -> Result<AllowHeaders, ConfigError> {
        if self.allowed_headers.iter().any(|h| h == "*") {
            return Ok(if self.allow_credentials {
                AllowHeaders::mirror_request()
            } else {
                AllowHeaders::any()
            });
        }

        // Origin is always allowed.
        let mut names = if self.allowed_headers.is_empty() {
            parse_names(DEFAULT_HEADERS.into_iter())?
        } else {
            vec![ORIGIN]
        };
        for name in parse_names(self.allowed_headers.iter().map(String::as_str))? {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Ok(AllowHeaders::list(names))
    }

    fn exposed(&self) -> Result<ExposeHeaders, ConfigError> {
        if self.exposed_headers.iter().any(|h| h == "*") {
            if self.allow_credentials {
                return Err(ConfigError::Cors(
                    "exposed header wildcard cannot be combined with credentials".to_owned(),
                ));
            }
            return Ok(ExposeHeaders::any());
        }
        Ok(ExposeHeaders::list(parse_names(self.exposed_headers.iter().map(String::as_str))?))
    }
}

fn parse_names<'a>(names: impl Iterator<Item = &'a str>) -> Result<Vec<HeaderName>, ConfigError> {
    names
        .map(|n| {
            HeaderName::from_bytes(n.trim().as_bytes())
                .map_err(|_| ConfigError::Cors(format!("invalid header name {n:?}")))
        })
        .collect()
}

fn parse_value(value: &str) -> Result<HeaderValue, ConfigError> {
    HeaderValue::from_str(value).map_err(|_| ConfigError::Cors(format!("invalid origin {value:?}")))
}

/// Request hook used when [`Cors::debug`] is set.
pub(crate) fn trace_origin<B>(req: http::Request<B>) -> http::Request<B> {
    if let Some(origin) = req.headers().get(ORIGIN) {
        tracing::debug!(
            origin = ?origin,
            method = %req.method(),
            path = req.uri().path(),
            preflight = req.method() == http::Method::OPTIONS,
            "cors request"
        );
    }
    req
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use bytes::Bytes;
    use http::header::{
        ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
        ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_REQUEST_METHOD,
    };
    use http_body_util::Full;
    use tower::{Layer, ServiceExt, service_fn};

    use super::*;

    async fn preflight(cors: Cors, origin: &'static str) -> http::Response<Full<Bytes>> {
        let svc = cors.to_layer().unwrap().layer(service_fn(|_req: http::Request<Full<Bytes>>| async {
            Ok::<_, Infallible>(http::Response::new(Full::new(Bytes::from_static(b"handler"))))
        }));
        let req = http::Request::options("/items")
            .header(ORIGIN, origin)
            .header(ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .body(Full::new(Bytes::new()))
            .unwrap();
        svc.oneshot(req).await.unwrap()
    }

    #[tokio::test]
    async fn defaults_allow_every_origin() {
        let res = preflight(Cors::new(), "https://a.test").await;

        assert_eq!(res.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        let methods = res.headers()[ACCESS_CONTROL_ALLOW_METHODS].to_str().unwrap();
        assert!(methods.contains("GET") && methods.contains("HEAD"), "{methods}");
        let headers = res.headers()[ACCESS_CONTROL_ALLOW_HEADERS].to_str().unwrap();
        assert!(headers.contains("x-requested-with"), "{headers}");
    }

    #[tokio::test]
    async fn wildcard_with_credentials_mirrors_the_origin() {
        let res = preflight(Cors::new().allow_credentials(true), "https://a.test").await;

        assert_eq!(res.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "https://a.test");
        assert_eq!(res.headers()[ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }

    #[tokio::test]
    async fn origin_patterns_match_subdomains() {
        let cors = || Cors::new().allow_origins(["https://*.example.com"]);

        let res = preflight(cors(), "https://api.example.com").await;
        assert_eq!(res.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "https://api.example.com");

        let res = preflight(cors(), "https://example.org").await;
        assert!(!res.headers().contains_key(ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[test]
    fn rejects_invalid_policies() {
        let exposed = Cors::new().expose_headers(["*"]).allow_credentials(true);
        assert!(matches!(exposed.to_layer(), Err(ConfigError::Cors(_))));

        let method = Cors::new().allow_methods(["GE T"]);
        assert!(matches!(method.to_layer(), Err(ConfigError::Cors(_))));

        let origin = Cors::new().allow_origins(["https://*.*.example.com"]);
        assert!(matches!(origin.to_layer(), Err(ConfigError::Cors(_))));
    }
}
