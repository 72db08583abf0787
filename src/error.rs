//! Unified error types.

use crate::method::Method;

/// The error type returned by portico's fallible operations.
///
/// Application-level errors (404, 422, etc.) are expressed as HTTP
/// [`Response`](crate::Response) values, not as `Error`s. This type surfaces
/// setup mistakes, infrastructure failures (binding, accepting, TLS) and
/// body-rendering failures.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error("render: {0}")]
    Render(#[from] serde_json::Error),

    #[error("log queue closed")]
    LogQueueClosed,
}

/// A setup-time mistake. Always reported before the first request is served.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid route `{path}`: {source}")]
    InvalidRoute {
        path: String,
        #[source]
        source: matchit::InsertError,
    },

    #[error("file route `{0}` must end with `/*filepath`")]
    FileRoutePattern(String),

    #[error("unknown method `{0}`")]
    UnknownMethod(String),

    #[error("route table is sealed, cannot register `{method} {path}`")]
    Sealed { method: Method, path: String },

    #[error("cors: {0}")]
    Cors(String),

    #[error("tls: {0}")]
    Tls(String),
}
