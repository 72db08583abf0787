//! Handlers and the erased form every layer shares.
//!
//! Route handlers are plain async functions. Once registered they become a
//! [`BoxedHandler`], and from then on a handler and a handler wrapped in
//! middlewares are indistinguishable: [`Middleware::wrap`] takes one
//! `BoxedHandler` and returns another. A middleware that keeps state
//! implements [`ErasedHandler`] for its own wrapper type.
//!
//! ```text
//! async fn hello(req: Request) -> impl IntoResponse
//!        ↓ .get("/", hello, [..])
//! BoxedHandler
//!        ↓ route, group, global middlewares wrap it (RouteTable::seal)
//! BoxedHandler   ← what the pipeline calls, inside panic isolation
//! ```
//!
//! [`Middleware::wrap`]: crate::Middleware::wrap

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::request::Request;
use crate::response::{IntoResponse, Response};

/// The future every layer of a chain returns.
pub type BoxFuture = Pin<Box<dyn Future<Output = Response> + Send + 'static>>;

/// One layer of a request chain.
///
/// Implement this for the handler a custom [`Middleware`](crate::Middleware)
/// returns from `wrap`; it usually holds the next `BoxedHandler` and calls
/// it from `call`.
pub trait ErasedHandler: Send + Sync + 'static {
    fn call(&self, req: Request) -> BoxFuture;
}

/// A chain, shared by every connection task serving the route.
pub type BoxedHandler = Arc<dyn ErasedHandler>;

/// Satisfied by `Fn(Request) -> impl Future<Output = impl IntoResponse>`.
///
/// Sealed; anything else that wants to sit in a chain implements
/// [`ErasedHandler`] instead.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(Endpoint(self))
    }
}

/// The innermost layer: a user function plus its response conversion.
struct Endpoint<F>(F);

impl<F, Fut, R> ErasedHandler for Endpoint<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture {
        let fut = (self.0)(req);
        Box::pin(async move { fut.await.into_response() })
    }
}
