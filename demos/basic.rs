//! Minimal portico demo: JSON endpoints, a route group, static files and a
//! custom panic response.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl -i http://localhost:3000/users/42
//!   curl -i -X POST http://localhost:3000/users -d '{"name":"alice"}'
//!   curl -i -H 'X-Request-Id: abc' http://localhost:3000/admin/stats
//!   curl -i http://localhost:3000/boom
//!   curl -i http://localhost:3000/static/basic.rs
//!
//! Live restart (Unix): `kill -USR2 <pid>` starts a fresh process on the same
//! socket and drains this one.

use http::StatusCode;
use portico::{Cors, PanicReport, Register, Request, RequestHead, Response, Server, middleware};
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
struct NewUser {
    name: String,
}

#[derive(Serialize)]
struct User {
    id: u64,
    name: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let timing = middleware::from_fn(|req: Request, next: middleware::Next| async move {
        let started = std::time::Instant::now();
        let mut res = next.run(req).await;
        if let Ok(value) = format!("app;dur={}", started.elapsed().as_millis()).parse() {
            res.headers_mut().insert("server-timing", value);
        }
        res
    });

    let admin_only = middleware::from_fn(|req: Request, next: middleware::Next| async move {
        if req.header("x-request-id").is_none() {
            return Response::status(StatusCode::UNAUTHORIZED);
        }
        next.run(req).await
    });

    let server = Server::builder(3000)
        .logger()
        .cors(Cors::new().allow_methods(["GET", "POST", "DELETE"]))
        .panic_handler(|report: &PanicReport, _req: &RequestHead, res: &mut Response| {
            res.set_body(format!("something broke, quote {} to support", report.request_id));
        })
        .middleware(timing)
        .get("/users/:id", get_user, [])
        .post("/users", create_user, [])
        .delete("/users/:id", delete_user, [])
        .get("/boom", boom, [])
        .files("/static/*filepath", "demos", [])
        .group("/admin", [admin_only])
        .get("/stats", stats, [])
        .finish()
        .build();

    let mut server = match server {
        Ok(server) => server,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    let Some(errors) = server.listen_error() else {
        return;
    };
    tokio::spawn(server.run());
    if let Some(err) = errors.await {
        eprintln!("server failed: {err}");
        std::process::exit(1);
    }
}

// GET /users/:id
async fn get_user(req: Request) -> Result<Response, portico::Error> {
    let id = req.query("id").unwrap_or_default();
    Response::json(&serde_json::json!({ "id": id, "name": "alice" }))
}

// POST /users {"name": "..."}
async fn create_user(req: Request) -> Result<Response, portico::Error> {
    let Ok(new) = serde_json::from_slice::<NewUser>(req.body()) else {
        return Ok(Response::status(StatusCode::BAD_REQUEST));
    };
    let user = User { id: 99, name: new.name };
    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header("location", "/users/99")
        .json(&user)?)
}

// DELETE /users/:id → 204 No Content
async fn delete_user(_req: Request) -> StatusCode {
    StatusCode::NO_CONTENT
}

// GET /boom → 500 with the custom body, server keeps running
async fn boom(_req: Request) -> String {
    let items = [1, 2];
    let idx = std::hint::black_box(2);
    items[idx].to_string()
}

// GET /admin/stats
async fn stats(req: Request) -> String {
    format!("stats for request {}", req.request_id())
}
