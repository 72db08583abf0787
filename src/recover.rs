//! Panic isolation for request handling.
//!
//! The composed chain (middlewares + handler) runs inside
//! [`catch_unwind`](futures_util::FutureExt::catch_unwind). A panic anywhere
//! in it is contained to the current request: the client gets a fixed
//! `500`, the optional [`PanicHandler`] may rewrite that response, and a
//! diagnostic with the captured backtrace goes to the log. The server keeps
//! accepting requests.
//!
//! Responses are values here, so a panicking chain has never sent anything:
//! the generic `500` is always the first and only response for the request.
//!
//! Panics raised outside a request (for example on the access-log writer
//! thread) are not caught by this module.
//!
//! # Backtraces
//!
//! By the time `catch_unwind` returns, the panicking stack is gone. A
//! process-wide panic hook, installed once, captures the backtrace at the
//! panic site, but only while a request chain is being polled on the current
//! thread; every other panic is passed to the previously installed hook.
//! None of this works under `panic = "abort"`.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};

use futures_util::FutureExt;
use http::StatusCode;

use crate::handler::BoxFuture;
use crate::request::RequestHead;
use crate::response::Response;

/// Body of the generic panic response.
pub(crate) const PANIC_BODY: &str = "Internal Server Error";

/// What was recovered from a panicking request.
#[derive(Debug, Clone)]
pub struct PanicReport {
    /// The panic payload, if it was a string; a placeholder otherwise.
    pub message: String,
    /// Stack at the panic site, or empty if it could not be captured.
    pub backtrace: String,
    pub request_id: String,
}

/// User hook invoked after a request panicked.
///
/// Runs after the generic `500` response has been prepared; whatever it
/// leaves in `res` is what the client receives. A panic inside the hook is
/// itself contained and the generic response is sent.
pub trait PanicHandler: Send + Sync + 'static {
    fn on_panic(&self, report: &PanicReport, req: &RequestHead, res: &mut Response);
}

impl<F> PanicHandler for F
where
    F: Fn(&PanicReport, &RequestHead, &mut Response) + Send + Sync + 'static,
{
    fn on_panic(&self, report: &PanicReport, req: &RequestHead, res: &mut Response) {
        self(report, req, res)
    }
}

thread_local! {
    static IN_REQUEST: Cell<bool> = const { Cell::new(false) };
    static BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

pub(crate) fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if IN_REQUEST.with(Cell::get) {
                BACKTRACE.with(|slot| *slot.borrow_mut() = Some(Backtrace::force_capture()));
            } else {
                previous(info);
            }
        }));
    });
}

/// Marks the current thread as polling a request chain for the duration of
/// one `poll`.
struct Scoped(BoxFuture);

impl Future for Scoped {
    type Output = Response;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Response> {
        let _guard = ScopeGuard::enter();
        self.0.as_mut().poll(cx)
    }
}

struct ScopeGuard(bool);

impl ScopeGuard {
    fn enter() -> Self {
        Self(IN_REQUEST.with(|flag| flag.replace(true)))
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        IN_REQUEST.with(|flag| flag.set(self.0));
    }
}

/// Runs `chain`, converting a panic into a report and the generic response.
pub(crate) async fn isolate(chain: BoxFuture, request_id: &str) -> Result<Response, PanicReport> {
    BACKTRACE.with(|slot| slot.borrow_mut().take());

    match AssertUnwindSafe(Scoped(chain)).catch_unwind().await {
        Ok(res) => Ok(res),
        Err(payload) => {
            // Same poll, same thread as the hook that filled the slot.
            let backtrace = BACKTRACE
                .with(|slot| slot.borrow_mut().take())
                .map(|bt| bt.to_string())
                .unwrap_or_default();
            Err(PanicReport {
                message: payload_message(payload.as_ref()),
                backtrace,
                request_id: request_id.to_owned(),
            })
        }
    }
}

/// The generic response, possibly rewritten by the user hook.
pub(crate) fn panic_response(
    report: &PanicReport,
    head: &RequestHead,
    handler: Option<&dyn PanicHandler>,
) -> Response {
    let generic = || {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .text(PANIC_BODY)
    };

    let mut res = generic();
    if let Some(handler) = handler {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.on_panic(report, head, &mut res)));
        if outcome.is_err() {
            tracing::error!(request_id = %report.request_id, "panic handler panicked");
            res = generic();
        }
    }
    res
}

/// Multi-line diagnostic entry for the log pipeline, newline terminated.
pub(crate) fn diagnostic(report: &PanicReport, head: &RequestHead) -> String {
    let id = &report.request_id;
    format!(
        "{} | portico | PANIC | {} | {} | {id}\n\
         -- panic start ({id}) --\n\
         {}\n\
         {}\
         -- panic end ({id}) --\n",
        humantime::format_rfc3339_seconds(std::time::SystemTime::now()),
        head.method,
        head.uri.path(),
        report.message,
        with_trailing_newline(&report.backtrace),
    )
}

fn with_trailing_newline(s: &str) -> String {
    if s.is_empty() || s.ends_with('\n') {
        s.to_owned()
    } else {
        format!("{s}\n")
    }
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
