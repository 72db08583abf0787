//! The per-request pipeline.
//!
//! ```text
//! route lookup → enrichment (request id, decoded params → query)
//!              → panic isolation ⊃ global ⊃ group ⊃ route ⊃ handler
//!              → status capture (Date, Request-Id)
//!              → access log
//! ```
//!
//! The access log sits outside panic isolation, so a request that panicked
//! still produces exactly one access line, carrying the status the client
//! actually received.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use http::header::{ALLOW, HeaderValue};
use http::StatusCode;
use http_body::Body;
use http_body_util::{BodyExt, Full};
use tracing::{error, warn};

use crate::access_log::{LogQueue, LogRecord};
use crate::capture::ResponseCapture;
use crate::enrich::{self, RequestContext, X_REQUEST_ID};
use crate::handler::BoxedHandler;
use crate::method::Method;
use crate::recover::{self, PanicHandler};
use crate::request::{Request, RequestHead};
use crate::response::Response;
use crate::router::{Lookup, RouteTable};

/// Everything a connection task needs to serve requests. Read-only.
pub(crate) struct App {
    pub(crate) routes: RouteTable,
    pub(crate) not_found: Option<BoxedHandler>,
    pub(crate) panic_handler: Option<Arc<dyn PanicHandler>>,
    pub(crate) log: LogQueue,
    pub(crate) access_log: bool,
}

impl App {
    /// Routes one request and produces one response.
    pub(crate) async fn dispatch<B>(&self, req: http::Request<B>) -> http::Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        let started = Instant::now();
        let (mut parts, body) = req.into_parts();
        let ctx = RequestContext::new(&mut parts.headers, started);
        let x_request_id = parts.headers.get(X_REQUEST_ID).cloned();

        let method = parts.method.clone();
        let path = parts.uri.path().to_owned();

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(request_id = ctx.request_id(), error = %e, "failed to read request body");
                let res = Response::status(StatusCode::BAD_REQUEST);
                return self.finish(res, &ctx, x_request_id, method, path).await;
            }
        };

        let res = match self.routes.lookup(&parts.method, &path) {
            Lookup::Found { handler, params } => {
                let params = enrich::decode_params(params);
                parts.uri = enrich::merge_params(parts.uri, &params);
                self.invoke(handler, RequestHead::from(parts), body, &ctx).await
            }
            Lookup::MethodNotAllowed { allow } => method_not_allowed(&parts.method, &allow),
            Lookup::NotFound => match &self.not_found {
                Some(handler) => {
                    self.invoke(handler.clone(), RequestHead::from(parts), body, &ctx).await
                }
                None => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .text("404 page not found"),
            },
        };

        self.finish(res, &ctx, x_request_id, method, path).await
    }

    /// Runs a handler chain under panic isolation.
    async fn invoke(
        &self,
        handler: BoxedHandler,
        head: RequestHead,
        body: Bytes,
        ctx: &RequestContext,
    ) -> Response {
        let kept = head.clone();
        let chain = handler.call(Request::new(head, body));

        match recover::isolate(chain, ctx.request_id()).await {
            Ok(res) => res,
            Err(report) => {
                error!(
                    request_id = %report.request_id,
                    method = %kept.method,
                    path = kept.uri.path(),
                    panic = %report.message,
                    "request handler panicked"
                );
                let entry = recover::diagnostic(&report, &kept);
                if let Err(e) = self.log.push(Bytes::from(entry)).await {
                    warn!(error = %e, "panic diagnostic dropped");
                }
                recover::panic_response(&report, &kept, self.panic_handler.as_deref())
            }
        }
    }

    async fn finish(
        &self,
        mut res: Response,
        ctx: &RequestContext,
        x_request_id: Option<HeaderValue>,
        method: http::Method,
        path: String,
    ) -> http::Response<Full<Bytes>> {
        let mut capture = ResponseCapture::new();
        capture.commit(&mut res, &ctx.request_id, x_request_id);

        if self.access_log {
            let record = LogRecord {
                timestamp: SystemTime::now(),
                method,
                status: capture.status(),
                path,
                elapsed: ctx.started.elapsed(),
                request_id: ctx.request_id().to_owned(),
            };
            if let Err(e) = self.log.push(record.encode()).await {
                warn!(error = %e, "access log line dropped");
            }
        }

        res.into_inner()
    }
}

/// `405` with `Allow`, or `200` with `Allow` for an unrouted `OPTIONS`.
fn method_not_allowed(method: &http::Method, allow: &[Method]) -> Response {
    let mut methods: Vec<&str> = allow.iter().map(|m| m.as_str()).collect();
    methods.push("OPTIONS");
    methods.dedup();
    let allow = methods.join(", ");

    let res = if *method == http::Method::OPTIONS {
        Response::builder().no_body()
    } else {
        Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .text("Method Not Allowed")
    };
    with_allow(res, &allow)
}

fn with_allow(mut res: Response, allow: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(allow) {
        res.headers_mut().insert(ALLOW, value);
    }
    res
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use http::header::DATE;

    use super::*;
    use crate::access_log::{self, testing::SharedSink};
    use crate::enrich::REQUEST_ID;
    use crate::handler::Handler;
    use crate::middleware::{self, BoxedMiddleware, Next};

    fn get(uri: &str) -> http::Request<Full<Bytes>> {
        http::Request::get(uri).body(Full::new(Bytes::new())).unwrap()
    }

    fn app(routes: RouteTable, sink: &SharedSink) -> App {
        recover::install_hook();
        let (log, _writer) = access_log::spawn(sink.clone(), 64).unwrap();
        App { routes, not_found: None, panic_handler: None, log, access_log: true }
    }

    fn header_setter(name: &'static str) -> BoxedMiddleware {
        middleware::from_fn(move |req: Request, next: Next| async move {
            let mut res = next.run(req).await;
            res.headers_mut().insert(name, HeaderValue::from_static("1"));
            res
        })
    }

    fn echo_id() -> BoxedHandler {
        (|req: Request| async move { format!("id={}", req.query("id").unwrap_or("-")) })
            .into_boxed_handler()
    }

    fn boom() -> BoxedHandler {
        (|_req: Request| async move {
            let arr = [1, 2];
            let idx = std::hint::black_box(2);
            format!("{}", arr[idx])
        })
        .into_boxed_handler()
    }

    async fn text(res: http::Response<Full<Bytes>>) -> String {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn wait_for(sink: &SharedSink, needle: &str) -> String {
        for _ in 0..100 {
            let contents = sink.contents();
            if contents.contains(needle) {
                return contents;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        sink.contents()
    }

    #[tokio::test]
    async fn global_and_route_middleware_headers_and_params_reach_the_response() {
        let mut routes = RouteTable::new();
        routes
            .register(Method::Get, "/item/:id", echo_id(), vec![header_setter("y")])
            .unwrap();
        routes.seal(&[header_setter("x")]);
        let sink = SharedSink::default();
        let app = app(routes, &sink);

        let res = app.dispatch(get("/item/42")).await;

        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().contains_key("x"));
        assert!(res.headers().contains_key("y"));
        assert!(res.headers().contains_key(DATE));
        assert!(!res.headers()[REQUEST_ID].is_empty());
        assert_eq!(text(res).await, "id=42");
    }

    #[tokio::test]
    async fn path_params_arrive_decoded() {
        let mut routes = RouteTable::new();
        routes.register(Method::Get, "/item/:id", echo_id(), Vec::new()).unwrap();
        routes.seal(&[]);
        let app = app(routes, &SharedSink::default());

        assert_eq!(text(app.dispatch(get("/item/a%20b")).await).await, "id=a b");
        assert_eq!(text(app.dispatch(get("/item/1+2%2F3")).await).await, "id=1+2/3");
    }

    #[tokio::test]
    async fn panic_yields_500_and_the_next_request_succeeds() {
        let mut routes = RouteTable::new();
        routes.register(Method::Get, "/boom", boom(), Vec::new()).unwrap();
        routes.register(Method::Get, "/ok", echo_id(), Vec::new()).unwrap();
        routes.seal(&[]);
        let sink = SharedSink::default();
        let app = app(routes, &sink);

        let res = app.dispatch(get("/boom")).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let id = res.headers()[REQUEST_ID].to_str().unwrap().to_owned();
        assert_eq!(text(res).await, recover::PANIC_BODY);

        let res = app.dispatch(get("/ok")).await;
        assert_eq!(res.status(), StatusCode::OK);

        // Entries are written in enqueue order, so the last access line comes last.
        let contents = wait_for(&sink, "| GET | 200 | /ok | ").await;
        assert!(contents.contains(&format!("| PANIC | GET | /boom | {id}")));
        assert!(contents.contains(&format!("-- panic start ({id}) --")));
        assert!(contents.contains(&format!("-- panic end ({id}) --")));
        assert!(contents.contains("| GET | 500 | /boom | "));
    }

    #[tokio::test]
    async fn custom_panic_handler_sets_the_response() {
        let mut routes = RouteTable::new();
        routes.register(Method::Get, "/boom", boom(), Vec::new()).unwrap();
        routes.seal(&[]);
        let sink = SharedSink::default();
        let mut app = app(routes, &sink);
        app.panic_handler = Some(Arc::new(
            |report: &recover::PanicReport, _req: &RequestHead, res: &mut Response| {
                res.set_status(StatusCode::SERVICE_UNAVAILABLE);
                res.set_body(format!("sorry {}", report.request_id));
            },
        ));

        let mut req = get("/boom");
        req.headers_mut().insert(REQUEST_ID, HeaderValue::from_static("r-1"));
        let res = app.dispatch(req).await;

        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(text(res).await, "sorry r-1");
    }

    #[tokio::test]
    async fn request_id_rules_apply_to_the_response() {
        let mut routes = RouteTable::new();
        routes.register(Method::Get, "/", echo_id(), Vec::new()).unwrap();
        routes.seal(&[]);
        let sink = SharedSink::default();
        let app = app(routes, &sink);

        let mut only_x = get("/");
        only_x.headers_mut().insert(X_REQUEST_ID, HeaderValue::from_static("abc"));
        let res = app.dispatch(only_x).await;
        assert_eq!(res.headers()[REQUEST_ID], "abc");
        assert_eq!(res.headers()[X_REQUEST_ID], "abc");

        let mut both = get("/");
        both.headers_mut().insert(REQUEST_ID, HeaderValue::from_static("orig"));
        both.headers_mut().insert(X_REQUEST_ID, HeaderValue::from_static("other"));
        let res = app.dispatch(both).await;
        assert_eq!(res.headers()[REQUEST_ID], "orig");

        let mut seen = HashSet::new();
        for _ in 0..10 {
            let res = app.dispatch(get("/")).await;
            let id = res.headers()[REQUEST_ID].to_str().unwrap().to_owned();
            assert!(!id.is_empty());
            assert!(seen.insert(id));
        }
    }

    #[tokio::test]
    async fn concurrent_requests_produce_one_line_each() {
        let mut routes = RouteTable::new();
        routes.register(Method::Get, "/item/:id", echo_id(), Vec::new()).unwrap();
        routes.seal(&[]);
        let sink = SharedSink::default();
        let app = Arc::new(app(routes, &sink));

        let mut tasks = Vec::new();
        for i in 0..50 {
            let app = Arc::clone(&app);
            tasks.push(tokio::spawn(async move {
                let mut req = get(&format!("/item/{i}"));
                let id = format!("req-{i}");
                req.headers_mut().insert(REQUEST_ID, HeaderValue::from_str(&id).unwrap());
                app.dispatch(req).await;
                id
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }

        let lines = sink.wait_for_lines(50).await;
        assert_eq!(lines.len(), 50);
        for (i, id) in ids.iter().enumerate() {
            let line = lines
                .iter()
                .find(|l| l.ends_with(&format!("| {id}")))
                .unwrap_or_else(|| panic!("no line for {id}"));
            assert!(line.contains(&format!("| GET | 200 | /item/{i} | ")), "{line}");
        }
    }

    #[tokio::test]
    async fn unknown_paths_and_methods() {
        let mut routes = RouteTable::new();
        routes.register(Method::Get, "/items", echo_id(), Vec::new()).unwrap();
        routes.seal(&[]);
        let sink = SharedSink::default();
        let mut app = app(routes, &sink);

        let res = app.dispatch(get("/missing")).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(text(res).await, "404 page not found");

        let post = http::Request::post("/items").body(Full::new(Bytes::new())).unwrap();
        let res = app.dispatch(post).await;
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(res.headers()[ALLOW], "GET, OPTIONS");

        let options = http::Request::options("/items").body(Full::new(Bytes::new())).unwrap();
        let res = app.dispatch(options).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[ALLOW], "GET, OPTIONS");

        app.not_found = Some((|req: Request| async move {
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .text(format!("nothing at {}", req.path()))
        })
        .into_boxed_handler());
        let res = app.dispatch(get("/missing")).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert!(res.headers().contains_key(REQUEST_ID));
        assert_eq!(text(res).await, "nothing at /missing");
    }
}
