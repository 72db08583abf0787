//! # portico
//!
//! A thin convenience layer over hyper for services that want routing,
//! middleware, correlation ids, panic isolation and access logging without
//! writing the plumbing again.
//!
//! ## What every request goes through
//!
//! ```text
//! CORS filter (optional)
//!   → route lookup
//!   → request id (Request-Id, else X-Request-Id, else a new UUID)
//!   → path parameters merged into the query string
//!   → panic isolation
//!       → global middlewares → group middlewares → route middlewares → handler
//!   → Date / Request-Id response headers, status recorded
//!   → one access-log line, written by a background thread
//! ```
//!
//! A panicking handler costs one request a `500`; the server keeps going.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use portico::{Register, Request, Response, Server, middleware};
//! use http::StatusCode;
//!
//! #[tokio::main]
//! async fn main() {
//!     let stamp = middleware::from_fn(|req: Request, next: middleware::Next| async move {
//!         let mut res = next.run(req).await;
//!         res.headers_mut().insert("x-served-by", "portico".parse().unwrap());
//!         res
//!     });
//!
//!     let mut server = Server::builder(3000)
//!         .logger()
//!         .middleware(stamp)
//!         .get("/users/:id", get_user, [])
//!         .group("/admin", [])
//!         .post("/users", create_user, [])
//!         .finish()
//!         .build()
//!         .expect("valid configuration");
//!
//!     let errors = server.listen_error().expect("first call");
//!     tokio::spawn(server.run());
//!     if let Some(err) = errors.await {
//!         eprintln!("server failed: {err}");
//!     }
//! }
//!
//! async fn get_user(req: Request) -> Result<Response, portico::Error> {
//!     let id = req.query("id").unwrap_or_default();
//!     Response::json(&serde_json::json!({ "id": id }))
//! }
//!
//! async fn create_user(req: Request) -> Response {
//!     if req.body().is_empty() {
//!         return Response::status(StatusCode::BAD_REQUEST);
//!     }
//!     Response::builder()
//!         .status(StatusCode::CREATED)
//!         .header("location", "/users/99")
//!         .no_body()
//! }
//! ```
//!
//! ## Logging
//!
//! Lifecycle and infrastructure events are emitted with [`tracing`]; install
//! a subscriber to see them. Access lines and panic diagnostics bypass
//! `tracing` and go through a bounded queue to one sink (standard error, or
//! the writer given to [`ServerBuilder::logger_to`]):
//!
//! ```text
//! 2024-05-01T12:00:00Z | portico | GET | 200 | /users/42 | 1.2ms | 3f2b…
//! ```

mod access_log;
mod builder;
mod capture;
mod cors;
mod enrich;
mod error;
mod files;
mod handler;
mod listener;
mod method;
mod pipeline;
mod recover;
mod request;
mod response;
mod router;
mod server;
mod tls;

pub mod middleware;

pub use access_log::{DEFAULT_CAPACITY as DEFAULT_LOG_CAPACITY, LogRecord};
pub use builder::{GroupBuilder, Register, ServerBuilder};
pub use cors::Cors;
pub use error::{ConfigError, Error};
pub use handler::{BoxFuture, BoxedHandler, ErasedHandler, Handler};
pub use listener::LISTEN_FD_ENV;
pub use method::Method;
pub use middleware::{BoxedMiddleware, Middleware, Next};
pub use recover::{PanicHandler, PanicReport};
pub use request::{Request, RequestHead};
pub use response::{ContentType, IntoResponse, Response, ResponseBuilder};
pub use server::{ListenError, Server};
pub use tls::TlsConfig;
