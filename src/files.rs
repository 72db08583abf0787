//! Static file serving under a `/*filepath` route.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use http::StatusCode;

use crate::handler::{BoxedHandler, Handler};
use crate::request::Request;
use crate::response::Response;

const PARAM: &str = "filepath";
const INDEX: &str = "index.html";

/// Handler serving files below `root`.
///
/// The file is named by the `filepath` path parameter. Since parameters are
/// appended after the client's own query values, the last value is the one
/// the router matched.
pub(crate) fn handler(root: PathBuf) -> BoxedHandler {
    let root = Arc::new(root);
    (move |req: Request| {
        let root = Arc::clone(&root);
        async move {
            let Some(raw) = req.query_all(PARAM).last() else {
                return not_found();
            };
            let Some(relative) = sanitize(raw) else {
                tracing::debug!(path = req.path(), "rejected file path");
                return not_found();
            };
            serve(&root.join(relative)).await
        }
    })
    .into_boxed_handler()
}

/// Keeps only normal components; anything that could escape `root` is refused.
fn sanitize(raw: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(raw.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(clean)
}

async fn serve(path: &Path) -> Response {
    let mut path = path.to_path_buf();
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_dir() => path.push(INDEX),
        Ok(_) => {}
        Err(_) => return not_found(),
    }

    match tokio::fs::read(&path).await {
        Ok(contents) => {
            let mut res = Response::builder().header("content-type", content_type(&path)).no_body();
            res.set_body(contents);
            res
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => not_found(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read file");
            Response::status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn not_found() -> Response {
    Response::builder().status(StatusCode::NOT_FOUND).text("404 page not found")
}

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::request::RequestHead;

    fn request(uri: &str) -> Request {
        let (parts, ()) = http::Request::get(uri).body(()).unwrap().into_parts();
        Request::new(RequestHead::from(parts), Bytes::new())
    }

    fn site(name: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("portico-files-{}-{name}", std::process::id()));
        std::fs::create_dir_all(root.join("docs")).unwrap();
        std::fs::write(root.join("app.css"), "body {}").unwrap();
        std::fs::write(root.join("docs").join(INDEX), "<h1>docs</h1>").unwrap();
        root
    }

    #[test]
    fn sanitize_rejects_escapes() {
        assert_eq!(sanitize("css/app.css"), Some(PathBuf::from("css/app.css")));
        assert_eq!(sanitize("/css/./app.css"), Some(PathBuf::from("css/app.css")));
        assert_eq!(sanitize("../etc/passwd"), None);
        assert_eq!(sanitize("css/../../secret"), None);
    }

    #[tokio::test]
    async fn serves_files_and_directory_indexes() {
        let files = handler(site("index"));

        let res = files.call(request("/static/app.css?filepath=app.css")).await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(res.headers()["content-type"], "text/css; charset=utf-8");
        assert_eq!(res.body(), b"body {}");

        let res = files.call(request("/static/docs?filepath=docs")).await;
        assert_eq!(res.body(), b"<h1>docs</h1>");
    }

    #[tokio::test]
    async fn uses_the_matched_parameter_over_client_query() {
        let files = handler(site("param"));
        let res = files
            .call(request("/static/app.css?filepath=../secret&filepath=app.css"))
            .await;
        assert_eq!(res.status_code(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_and_escaping_paths_are_404() {
        let files = handler(site("missing"));

        let res = files.call(request("/static/nope?filepath=nope.txt")).await;
        assert_eq!(res.status_code(), StatusCode::NOT_FOUND);

        let res = files.call(request("/static/x?filepath=..%2F..%2Fetc%2Fpasswd")).await;
        assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
    }
}
