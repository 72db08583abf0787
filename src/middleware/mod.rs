//! Middleware composition.
//!
//! A middleware is a decorator: it receives the next handler and returns a
//! new handler. Whether the request reaches the next layer is entirely up to
//! the middleware: forwarding is an explicit [`Next::run`] call, and
//! skipping it short-circuits everything downstream, handler included.
//!
//! # Precedence
//!
//! Three scopes contribute layers to every route:
//!
//! ```text
//! global[0] → … → global[n-1] → group[0] → … → group[m-1] → route[0] → … → route[k-1] → handler
//! ```
//!
//! Within a scope the first middleware added runs first. Broader scopes
//! always wrap narrower ones. [`compose`] is the only place that nesting
//! happens.

use std::future::Future;
use std::sync::Arc;

use crate::handler::{BoxFuture, BoxedHandler, ErasedHandler};
use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// A shared, type-erased middleware.
pub type BoxedMiddleware = Arc<dyn Middleware>;

/// Wraps the next handler in a new one.
///
/// Most middleware is easier to write with [`from_fn`]; implement this trait
/// directly when the layer carries its own state.
pub trait Middleware: Send + Sync + 'static {
    fn wrap(&self, next: BoxedHandler) -> BoxedHandler;
}

/// The remainder of the chain, as seen from inside a middleware.
///
/// `run` consumes `self`, so a middleware can forward a request at most once.
pub struct Next(BoxedHandler);

impl Next {
    /// Forwards the request to the next layer and returns its response.
    pub async fn run(self, req: Request) -> Response {
        self.0.call(req).await
    }
}

/// Builds a middleware from an async closure.
///
/// ```rust
/// use portico::{Next, Request, Response, middleware};
///
/// let stamp = middleware::from_fn(|req: Request, next: Next| async move {
///     let mut res = next.run(req).await;
///     res.headers_mut().insert("x-served-by", "portico".parse().unwrap());
///     res
/// });
///
/// let deny = middleware::from_fn(|req: Request, next: Next| async move {
///     if req.header("authorization").is_none() {
///         return Response::status(http::StatusCode::UNAUTHORIZED);
///     }
///     next.run(req).await
/// });
/// ```
pub fn from_fn<F, Fut, R>(f: F) -> BoxedMiddleware
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    Arc::new(FromFn { f: Arc::new(f) })
}

struct FromFn<F> {
    f: Arc<F>,
}

impl<F, Fut, R> Middleware for FromFn<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        Arc::new(FromFnHandler { f: Arc::clone(&self.f), next })
    }
}

struct FromFnHandler<F> {
    f: Arc<F>,
    next: BoxedHandler,
}

impl<F, Fut, R> ErasedHandler for FromFnHandler<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture {
        let fut = (self.f)(req, Next(Arc::clone(&self.next)));
        Box::pin(async move { fut.await.into_response() })
    }
}

/// Nests `handler` inside every scope's middlewares, outermost first.
pub(crate) fn compose(
    handler: BoxedHandler,
    global: &[BoxedMiddleware],
    scoped: &[BoxedMiddleware],
) -> BoxedHandler {
    global
        .iter()
        .chain(scoped)
        .rev()
        .fold(handler, |next, layer| layer.wrap(next))
}
