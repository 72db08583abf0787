//! HTTP server, graceful shutdown and live restart.
//!
//! # Stopping
//!
//! On **SIGTERM** or **SIGINT** (Ctrl-C) the server:
//! 1. stops accepting, so no new connection is made;
//! 2. tells every open connection to finish its in-flight request and close;
//! 3. waits up to the shutdown timeout (30 s by default), then drops what is left;
//! 4. flushes the access log and returns from [`Server::serve`].
//!
//! # Restarting (Unix)
//!
//! On **SIGUSR2** the server starts a new copy of the running executable,
//! hands it the listening socket, and then stops exactly as above. The new
//! process accepts connections from the moment it starts, so a deploy is a
//! binary swap plus one signal. If the new process cannot be started the
//! error is logged and the old one keeps serving.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::rt::{Read, Write};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tower::ServiceBuilder;
use tower::util::{BoxCloneService, MapRequestLayer};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::access_log::LogWriter;
use crate::builder::ServerBuilder;
use crate::cors;
use crate::error::Error;
use crate::listener;
use crate::pipeline::App;
use crate::tls::{HANDSHAKE_TIMEOUT, TlsConfig};

type Service = BoxCloneService<http::Request<Incoming>, http::Response<Full<Bytes>>, Infallible>;

/// Everything about serving that is not request handling.
pub(crate) struct Settings {
    pub(crate) port: u16,
    pub(crate) listener: Option<std::net::TcpListener>,
    pub(crate) tls: Option<TlsConfig>,
    /// The layer, and whether to trace every cross-origin request.
    pub(crate) cors: Option<(CorsLayer, bool)>,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) shutdown_timeout: Duration,
}

/// A configured, sealed HTTP server.
///
/// ```rust,no_run
/// use portico::{Register, Request, Server};
///
/// #[tokio::main]
/// async fn main() -> Result<(), portico::Error> {
///     Server::builder(3000)
///         .logger()
///         .get("/item/:id", |req: Request| async move {
///             format!("item {}", req.query("id").unwrap_or_default())
///         }, [])
///         .build()?
///         .serve()
///         .await
/// }
/// ```
pub struct Server {
    app: Arc<App>,
    settings: Settings,
    writer: LogWriter,
    errors: Option<oneshot::Sender<Error>>,
    listen_error: Option<ListenError>,
}

impl Server {
    /// Starts configuring a server that will listen on `0.0.0.0:port`.
    pub fn builder(port: u16) -> ServerBuilder {
        ServerBuilder::new(port)
    }

    pub(crate) fn new(app: App, settings: Settings, writer: LogWriter) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            app: Arc::new(app),
            settings,
            writer,
            errors: Some(tx),
            listen_error: Some(ListenError(rx)),
        }
    }

    /// The receiving end of the terminal-error slot used by [`run`](Self::run).
    ///
    /// Available once; later calls return `None`. The slot holds one error,
    /// so it is never lost if nobody is waiting when it is reported.
    pub fn listen_error(&mut self) -> Option<ListenError> {
        self.listen_error.take()
    }

    /// Serves until a stop signal, reporting a terminal error through
    /// [`listen_error`](Self::listen_error) instead of returning it.
    pub async fn run(mut self) {
        let errors = self.errors.take();
        if let Err(e) = self.serve().await {
            error!(error = %e, "server stopped with an error");
            if let Some(tx) = errors {
                // The slot is buffered; a dropped receiver just means nobody asked.
                let _ = tx.send(e);
            }
        }
    }

    /// Serves until SIGTERM or Ctrl-C, restarting on SIGUSR2 (Unix).
    pub async fn serve(self) -> Result<(), Error> {
        let signals = Signals::new()?;
        self.serve_until(Trigger::Os(signals)).await
    }

    /// Serves until `shutdown` resolves. OS signals are not handled.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.serve_until(Trigger::Custom(Box::pin(shutdown))).await
    }

    async fn serve_until(self, trigger: Trigger) -> Result<(), Error> {
        let Server { app, settings, writer, .. } = self;

        let result = accept_loop(app, settings, trigger).await;

        // Every queue handle is gone with the app; wait for the last lines.
        if tokio::task::spawn_blocking(move || writer.join()).await.is_err() {
            warn!("access log writer could not be joined");
        }
        info!("portico stopped");
        result
    }

    #[cfg(test)]
    pub(crate) fn app(&self) -> &App {
        &self.app
    }
}

/// Resolves to the error that stopped [`Server::run`], or `None` if the
/// server stopped cleanly.
pub struct ListenError(oneshot::Receiver<Error>);

impl ListenError {
    /// Takes the error if it has already been reported.
    pub fn try_recv(&mut self) -> Option<Error> {
        self.0.try_recv().ok()
    }

    /// Waits for the outcome from outside the runtime.
    pub fn blocking_recv(self) -> Option<Error> {
        self.0.blocking_recv().ok()
    }
}

impl Future for ListenError {
    type Output = Option<Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(Result::ok)
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

async fn accept_loop(app: Arc<App>, settings: Settings, mut trigger: Trigger) -> Result<(), Error> {
    let listener = TcpListener::from_std(listener::acquire(settings.port, settings.listener)?)?;
    info!(addr = ?listener.local_addr().ok(), tls = settings.tls.is_some(), "portico listening");

    let service = make_service(app, settings.cors);
    let acceptor = settings.tls.as_ref().map(TlsConfig::acceptor);

    let mut builder = ConnBuilder::new(TokioExecutor::new());
    if let Some(idle) = settings.idle_timeout {
        builder.http1().timer(TokioTimer::new()).header_read_timeout(idle);
    }
    let builder = Arc::new(builder);

    // Flipped once to tell every connection to wind down.
    let (drain_tx, drain_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            // Check the trigger first so a stop request wins over a backlog
            // of pending connections.
            biased;

            stop = trigger.recv() => match stop {
                Stop::Shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }
                Stop::Restart => match restart(&listener) {
                    Ok(pid) => {
                        info!(successor = pid, in_flight = tasks.len(), "restarting, draining connections");
                        break;
                    }
                    Err(e) => error!(error = %e, "restart failed, still serving"),
                },
            },

            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "accept error");
                        continue;
                    }
                };

                let service = service.clone();
                let builder = Arc::clone(&builder);
                let drain = drain_rx.clone();

                match acceptor.clone() {
                    Some(acceptor) => {
                        tasks.spawn(async move {
                            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                                Ok(Ok(tls)) => serve_connection(builder, TokioIo::new(tls), service, drain, peer).await,
                                Ok(Err(e)) => debug!(%peer, error = %e, "tls handshake failed"),
                                Err(_) => debug!(%peer, "tls handshake timed out"),
                            }
                        });
                    }
                    None => {
                        tasks.spawn(serve_connection(builder, TokioIo::new(stream), service, drain, peer));
                    }
                }
            }

            // Reap finished connection tasks so the JoinSet does not grow
            // without bound on long-running servers.
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    // Closing our copy of the socket; a successor keeps its own.
    drop(listener);
    drop(service);
    // Receivers only see an error if every sender is gone, which cannot
    // happen before this point.
    let _ = drain_tx.send(true);

    let drained = tokio::time::timeout(settings.shutdown_timeout, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = tasks.len(), "shutdown timeout elapsed, aborting connections");
        tasks.shutdown().await;
    }
    Ok(())
}

/// The per-request service: optional CORS tracing and CORS filtering
/// around the pipeline.
fn make_service(app: Arc<App>, cors: Option<(CorsLayer, bool)>) -> Service {
    let (layer, trace) = match cors {
        Some((layer, trace)) => (Some(layer), trace),
        None => (None, false),
    };

    let inner = tower::service_fn(move |req: http::Request<Incoming>| {
        let app = Arc::clone(&app);
        async move { Ok::<_, Infallible>(app.dispatch(req).await) }
    });

    let svc = ServiceBuilder::new()
        .option_layer(trace.then(|| MapRequestLayer::new(cors::trace_origin::<Incoming>)))
        .option_layer(layer)
        .service(inner);
    BoxCloneService::new(svc)
}

/// Drives one connection until it closes or the server drains.
async fn serve_connection<I>(
    builder: Arc<ConnBuilder<TokioExecutor>>,
    io: I,
    service: Service,
    mut drain: watch::Receiver<bool>,
    peer: SocketAddr,
) where
    I: Read + Write + Unpin + Send + 'static,
{
    let conn = builder.serve_connection(io, TowerToHyperService::new(service));
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => {
            if let Err(e) = res {
                debug!(%peer, error = %e, "connection error");
            }
            return;
        }
        _ = drain.wait_for(|draining| *draining) => {
            conn.as_mut().graceful_shutdown();
        }
    }

    if let Err(e) = conn.await {
        debug!(%peer, error = %e, "connection error while draining");
    }
}

// ── Stop triggers ─────────────────────────────────────────────────────────────

enum Stop {
    Shutdown,
    Restart,
}

enum Trigger {
    Os(Signals),
    Custom(Pin<Box<dyn Future<Output = ()> + Send>>),
}

impl Trigger {
    /// Only ever awaited again after a failed restart, which a custom
    /// trigger never produces.
    async fn recv(&mut self) -> Stop {
        match self {
            Self::Os(signals) => signals.recv().await,
            Self::Custom(shutdown) => {
                shutdown.as_mut().await;
                Stop::Shutdown
            }
        }
    }
}

#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    restart: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            restart: signal(SignalKind::user_defined2())?,
        })
    }

    async fn recv(&mut self) -> Stop {
        tokio::select! {
            _ = self.interrupt.recv() => Stop::Shutdown,
            _ = self.terminate.recv() => Stop::Shutdown,
            _ = self.restart.recv() => Stop::Restart,
        }
    }
}

/// Ctrl-C only; there is no restart signal.
#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Stop {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        Stop::Shutdown
    }
}

#[cfg(unix)]
fn restart(listener: &TcpListener) -> io::Result<u32> {
    listener::spawn_successor(listener).map(|child| child.id())
}

#[cfg(not(unix))]
fn restart(_listener: &TcpListener) -> io::Result<u32> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "live restart needs Unix"))
}
