//! Server configuration and route registration.
//!
//! Everything about a server is decided on a [`ServerBuilder`]. Calling
//! [`build`](ServerBuilder::build) seals the route table, composes every
//! middleware stack and yields a [`Server`] whose configuration can no longer
//! change. Registration mistakes are logged when they happen and returned by
//! `build`, so a misconfigured server never serves a request.

use std::io::{self, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use crate::access_log::{self, DEFAULT_CAPACITY};
use crate::cors::Cors;
use crate::error::{ConfigError, Error};
use crate::files;
use crate::handler::{BoxedHandler, Handler};
use crate::method::Method;
use crate::middleware::BoxedMiddleware;
use crate::pipeline::App;
use crate::recover::{self, PanicHandler};
use crate::router::{self, RouteTable};
use crate::server::{Server, Settings};
use crate::tls::TlsConfig;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

// ── Register ──────────────────────────────────────────────────────────────────

/// Route registration, shared by [`ServerBuilder`] and [`GroupBuilder`].
///
/// Paths use `:name` for a segment parameter and `*name` for a trailing
/// catch-all; the matched values are readable with
/// [`Request::query`](crate::Request::query).
///
/// ```rust
/// use portico::{Register, Request, Server};
///
/// async fn show(req: Request) -> String {
///     format!("item {}", req.query("id").unwrap_or("?"))
/// }
///
/// let builder = Server::builder(8080)
///     .get("/item/:id", show, [])
///     .head_get("/health", |_req: Request| async { "ok" }, []);
/// ```
pub trait Register: Sized {
    /// Binds an already boxed handler. Every other method ends up here.
    #[doc(hidden)]
    fn route_boxed(
        self,
        method: Method,
        path: &str,
        handler: BoxedHandler,
        middlewares: Vec<BoxedMiddleware>,
    ) -> Self;

    #[doc(hidden)]
    fn fail(self, err: ConfigError) -> Self;

    /// Binds `handler` under `method` and `path`, wrapped in `middlewares`.
    fn route<H: Handler>(
        self,
        method: Method,
        path: &str,
        handler: H,
        middlewares: impl IntoIterator<Item = BoxedMiddleware>,
    ) -> Self {
        self.route_boxed(method, path, handler.into_boxed_handler(), middlewares.into_iter().collect())
    }

    /// Like [`route`](Register::route), with the method given by its wire
    /// name (`"GET"`, `"POST"`, …). An unknown name is a configuration error.
    fn add_handler<H: Handler>(
        self,
        method: &str,
        path: &str,
        handler: H,
        middlewares: impl IntoIterator<Item = BoxedMiddleware>,
    ) -> Self {
        match method.parse::<Method>() {
            Ok(method) => self.route(method, path, handler, middlewares),
            Err(e) => self.fail(e),
        }
    }

    fn get<H: Handler>(self, path: &str, handler: H, middlewares: impl IntoIterator<Item = BoxedMiddleware>) -> Self {
        self.route(Method::Get, path, handler, middlewares)
    }

    fn head<H: Handler>(self, path: &str, handler: H, middlewares: impl IntoIterator<Item = BoxedMiddleware>) -> Self {
        self.route(Method::Head, path, handler, middlewares)
    }

    /// Registers the same handler under both `HEAD` and `GET`.
    fn head_get<H: Handler>(
        self,
        path: &str,
        handler: H,
        middlewares: impl IntoIterator<Item = BoxedMiddleware>,
    ) -> Self {
        let handler = handler.into_boxed_handler();
        let middlewares: Vec<_> = middlewares.into_iter().collect();
        self.route_boxed(Method::Head, path, handler.clone(), middlewares.clone())
            .route_boxed(Method::Get, path, handler, middlewares)
    }

    fn post<H: Handler>(self, path: &str, handler: H, middlewares: impl IntoIterator<Item = BoxedMiddleware>) -> Self {
        self.route(Method::Post, path, handler, middlewares)
    }

    fn put<H: Handler>(self, path: &str, handler: H, middlewares: impl IntoIterator<Item = BoxedMiddleware>) -> Self {
        self.route(Method::Put, path, handler, middlewares)
    }

    fn delete<H: Handler>(self, path: &str, handler: H, middlewares: impl IntoIterator<Item = BoxedMiddleware>) -> Self {
        self.route(Method::Delete, path, handler, middlewares)
    }

    fn patch<H: Handler>(self, path: &str, handler: H, middlewares: impl IntoIterator<Item = BoxedMiddleware>) -> Self {
        self.route(Method::Patch, path, handler, middlewares)
    }

    fn options<H: Handler>(self, path: &str, handler: H, middlewares: impl IntoIterator<Item = BoxedMiddleware>) -> Self {
        self.route(Method::Options, path, handler, middlewares)
    }

    /// Serves the files below `root` under `pattern`, which must end in
    /// `/*filepath`. Directories serve their `index.html`.
    fn files(
        self,
        pattern: &str,
        root: impl Into<PathBuf>,
        middlewares: impl IntoIterator<Item = BoxedMiddleware>,
    ) -> Self {
        match router::check_file_pattern(pattern) {
            Ok(()) => self.route_boxed(
                Method::Get,
                pattern,
                files::handler(root.into()),
                middlewares.into_iter().collect(),
            ),
            Err(e) => self.fail(e),
        }
    }
}

// ── ServerBuilder ─────────────────────────────────────────────────────────────

/// Builder for a [`Server`]. Obtain one with [`Server::builder`].
pub struct ServerBuilder {
    port: u16,
    routes: RouteTable,
    middlewares: Vec<BoxedMiddleware>,
    not_found: Option<BoxedHandler>,
    panic_handler: Option<Arc<dyn PanicHandler>>,
    cors: Option<Cors>,
    tls: Option<TlsConfig>,
    idle_timeout: Option<Duration>,
    shutdown_timeout: Duration,
    access_log: bool,
    log_sink: Option<Box<dyn Write + Send>>,
    log_capacity: usize,
    listener: Option<TcpListener>,
    error: Option<Error>,
}

impl ServerBuilder {
    pub(crate) fn new(port: u16) -> Self {
        Self {
            port,
            routes: RouteTable::new(),
            middlewares: Vec::new(),
            not_found: None,
            panic_handler: None,
            cors: None,
            tls: None,
            idle_timeout: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            access_log: false,
            log_sink: None,
            log_capacity: DEFAULT_CAPACITY,
            listener: None,
            error: None,
        }
    }

    /// Closes keep-alive connections that send nothing for `timeout`.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// How long a shutdown or restart waits for in-flight requests before
    /// dropping them. Defaults to 30 seconds.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Loads TLS material from PEM files. A failure is reported by [`build`](Self::build).
    pub fn tls_pem(mut self, cert: impl AsRef<Path>, key: impl AsRef<Path>) -> Self {
        match TlsConfig::from_pem_files(cert, key) {
            Ok(tls) => self.tls = Some(tls),
            Err(e) => self.record(e),
        }
        self
    }

    pub fn cors(mut self, cors: Cors) -> Self {
        self.cors = Some(cors);
        self
    }

    /// Replaces the response sent after a handler panicked.
    ///
    /// ```rust
    /// use http::StatusCode;
    /// use portico::{PanicReport, RequestHead, Response, Server};
    ///
    /// let builder = Server::builder(8080).panic_handler(
    ///     |report: &PanicReport, _req: &RequestHead, res: &mut Response| {
    ///         res.set_status(StatusCode::SERVICE_UNAVAILABLE);
    ///         res.set_body(format!("request {} failed", report.request_id));
    ///     },
    /// );
    /// ```
    pub fn panic_handler(mut self, handler: impl PanicHandler) -> Self {
        self.panic_handler = Some(Arc::new(handler));
        self
    }

    /// Handler for requests no route matches. Runs without middlewares.
    pub fn not_found<H: Handler>(mut self, handler: H) -> Self {
        self.not_found = Some(handler.into_boxed_handler());
        self
    }

    /// Appends a global middleware. Global middlewares wrap every route,
    /// in the order they are added.
    pub fn middleware(mut self, middleware: BoxedMiddleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Enables access logging to standard error.
    pub fn logger(mut self) -> Self {
        self.access_log = true;
        self
    }

    /// Enables access logging to `sink`. Panic diagnostics go there too.
    pub fn logger_to(mut self, sink: impl Write + Send + 'static) -> Self {
        self.access_log = true;
        self.log_sink = Some(Box::new(sink));
        self
    }

    /// Maximum number of log entries waiting for the writer. Requests wait
    /// for room when it is reached.
    pub fn log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    /// Serves on an already bound socket instead of binding the port.
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Opens a group of routes sharing a path prefix and middlewares.
    pub fn group(self, prefix: &str, middlewares: impl IntoIterator<Item = BoxedMiddleware>) -> GroupBuilder {
        GroupBuilder {
            server: self,
            prefix: prefix.trim_end_matches('/').to_owned(),
            middlewares: middlewares.into_iter().collect(),
        }
    }

    /// Seals the configuration.
    ///
    /// Returns the first registration error, if any, and starts the log
    /// writer thread.
    pub fn build(mut self) -> Result<Server, Error> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let cors = self.cors.as_ref().map(|c| c.to_layer().map(|layer| (layer, c.debug))).transpose()?;
        self.routes.seal(&self.middlewares);
        recover::install_hook();

        let sink = self.log_sink.unwrap_or_else(|| Box::new(io::stderr()));
        let (log, writer) = access_log::spawn(sink, self.log_capacity)?;

        let app = App {
            routes: self.routes,
            not_found: self.not_found,
            panic_handler: self.panic_handler,
            log,
            access_log: self.access_log,
        };
        let settings = Settings {
            port: self.port,
            listener: self.listener,
            tls: self.tls,
            cors,
            idle_timeout: self.idle_timeout,
            shutdown_timeout: self.shutdown_timeout,
        };
        Ok(Server::new(app, settings, writer))
    }

    fn record(&mut self, err: impl Into<Error>) {
        let err = err.into();
        error!(error = %err, "invalid server configuration");
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}

impl Register for ServerBuilder {
    fn route_boxed(
        mut self,
        method: Method,
        path: &str,
        handler: BoxedHandler,
        middlewares: Vec<BoxedMiddleware>,
    ) -> Self {
        if let Err(e) = self.routes.register(method, path, handler, middlewares) {
            self.record(e);
        }
        self
    }

    fn fail(mut self, err: ConfigError) -> Self {
        self.record(err);
        self
    }
}

// ── GroupBuilder ──────────────────────────────────────────────────────────────

/// Routes sharing a path prefix and a middleware scope.
///
/// A group owns no routes: each registration is forwarded to the server with
/// the prefix prepended and the group's middlewares placed before the
/// route's own.
///
/// ```rust
/// use portico::{Register, Request, Server, middleware};
///
/// let auth = middleware::from_fn(|req: Request, next: middleware::Next| next.run(req));
///
/// let builder = Server::builder(8080)
///     .group("/admin", [auth])
///     .get("/stats", |_req: Request| async { "stats" }, [])
///     .finish();
/// ```
pub struct GroupBuilder {
    server: ServerBuilder,
    prefix: String,
    middlewares: Vec<BoxedMiddleware>,
}

impl GroupBuilder {
    /// Closes the group and returns the server builder.
    pub fn finish(self) -> ServerBuilder {
        self.server
    }
}

impl Register for GroupBuilder {
    fn route_boxed(
        mut self,
        method: Method,
        path: &str,
        handler: BoxedHandler,
        middlewares: Vec<BoxedMiddleware>,
    ) -> Self {
        let full = format!("{}{}", self.prefix, path);
        let scoped = self.middlewares.iter().cloned().chain(middlewares).collect();
        self.server = self.server.route_boxed(method, &full, handler, scoped);
        self
    }

    fn fail(mut self, err: ConfigError) -> Self {
        self.server = self.server.fail(err);
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use http::StatusCode;
    use http_body_util::Full;

    use super::*;
    use crate::access_log::testing::SharedSink;
    use crate::middleware::{self, Next};
    use crate::request::Request;

    type Trace = Arc<Mutex<Vec<&'static str>>>;

    fn recording(trace: &Trace, name: &'static str) -> BoxedMiddleware {
        let trace = Arc::clone(trace);
        middleware::from_fn(move |req: Request, next: Next| {
            let trace = Arc::clone(&trace);
            async move {
                trace.lock().unwrap().push(name);
                next.run(req).await
            }
        })
    }

    fn get(uri: &str) -> http::Request<Full<Bytes>> {
        http::Request::get(uri).body(Full::new(Bytes::new())).unwrap()
    }

    #[tokio::test]
    async fn group_scopes_nest_between_global_and_route() {
        let trace = Trace::default();
        let server = Server::builder(0)
            .middleware(recording(&trace, "global"))
            .group("/api/", [recording(&trace, "group")])
            .get("/users", |_req: Request| async { "users" }, [recording(&trace, "route")])
            .finish()
            .logger_to(SharedSink::default())
            .build()
            .unwrap();

        let res = server.app().dispatch(get("/api/users")).await;

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(*trace.lock().unwrap(), ["global", "group", "route"]);
    }

    #[tokio::test]
    async fn head_get_serves_both_methods() {
        let server = Server::builder(0)
            .head_get("/ping", |_req: Request| async { "pong" }, [])
            .build()
            .unwrap();

        let head = http::Request::head("/ping").body(Full::new(Bytes::new())).unwrap();
        assert_eq!(server.app().dispatch(head).await.status(), StatusCode::OK);
        assert_eq!(server.app().dispatch(get("/ping")).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn put_is_registered_as_put() {
        let server = Server::builder(0)
            .put("/items/:id", |_req: Request| async { StatusCode::NO_CONTENT }, [])
            .build()
            .unwrap();

        let put = http::Request::put("/items/1").body(Full::new(Bytes::new())).unwrap();
        assert_eq!(server.app().dispatch(put).await.status(), StatusCode::NO_CONTENT);
        let post = http::Request::post("/items/1").body(Full::new(Bytes::new())).unwrap();
        assert_eq!(server.app().dispatch(post).await.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn file_route_without_wildcard_fails_the_build() {
        let err = Server::builder(0)
            .files("/static", "/tmp", [])
            .get("/", |_req: Request| async { "ok" }, [])
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(ConfigError::FileRoutePattern(ref p)) if p == "/static"));
    }

    #[test]
    fn first_registration_error_wins() {
        let err = Server::builder(0)
            .add_handler("FETCH", "/a", |_req: Request| async { "a" }, [])
            .get("/b/:x", |_req: Request| async { "b" }, [])
            .get("/b/:y", |_req: Request| async { "b" }, [])
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(ConfigError::UnknownMethod(ref m)) if m == "FETCH"));
    }

    #[test]
    fn conflicting_routes_fail_the_build() {
        let err = Server::builder(0)
            .get("/b/:x", |_req: Request| async { "b" }, [])
            .group("/b", [])
            .get("/:y", |_req: Request| async { "b" }, [])
            .finish()
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(ConfigError::InvalidRoute { ref path, .. }) if path == "/b/:y"));
    }

    #[test]
    fn invalid_cors_fails_the_build() {
        let err = Server::builder(0)
            .cors(Cors::new().expose_headers(["*"]).allow_credentials(true))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(ConfigError::Cors(_))));
    }

    #[test]
    fn add_handler_takes_wire_names() {
        let ok = Server::builder(0)
            .add_handler("PATCH", "/a", |_req: Request| async { "a" }, [])
            .build();
        assert!(ok.is_ok());

        let lowercase = Server::builder(0)
            .add_handler("patch", "/a", |_req: Request| async { "a" }, [])
            .build();
        assert!(matches!(lowercase, Err(Error::Config(ConfigError::UnknownMethod(_)))));
    }
}
