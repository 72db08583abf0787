//! Asynchronous access logging.
//!
//! Request tasks never touch the log sink. They serialize one line and push
//! it onto a bounded queue; a single writer thread drains the queue in FIFO
//! order and writes each entry to the sink, flushing after every entry.
//!
//! # Backpressure
//!
//! The queue holds at most `capacity` entries. When it is full, [`LogQueue::push`]
//! waits until the writer makes room: memory stays bounded and a slow sink
//! slows request completion down instead of dropping lines. Producers never
//! wait on each other while there is room.
//!
//! # Ordering
//!
//! The writer sees one total order. Lines from one request keep their
//! relative order; lines from different requests appear in the order they
//! were enqueued, which need not match the order the requests finished.

use std::fmt;
use std::io::{self, BufWriter, Write};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::{Method, StatusCode};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Error;

/// Default queue capacity, in entries.
pub const DEFAULT_CAPACITY: usize = 65_536;

/// Producer handle. Cheap to clone; one per component that logs.
#[derive(Clone)]
pub(crate) struct LogQueue {
    tx: mpsc::Sender<Bytes>,
}

/// Owner of the writer thread.
pub(crate) struct LogWriter {
    handle: JoinHandle<()>,
}

/// Starts the writer thread and returns the queue feeding it.
///
/// The thread exits once every [`LogQueue`] clone has been dropped and the
/// remaining entries are written.
pub(crate) fn spawn<W>(sink: W, capacity: usize) -> io::Result<(LogQueue, LogWriter)>
where
    W: Write + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = thread::Builder::new()
        .name("portico-log".to_owned())
        .spawn(move || drain(rx, sink))?;
    Ok((LogQueue { tx }, LogWriter { handle }))
}

fn drain<W: Write>(mut rx: mpsc::Receiver<Bytes>, sink: W) {
    let mut out = BufWriter::new(sink);
    while let Some(entry) = rx.blocking_recv() {
        if let Err(e) = out.write_all(&entry).and_then(|()| out.flush()) {
            warn!(error = %e, "access log write failed");
        }
    }
}

impl LogQueue {
    /// Enqueues one serialized entry, waiting while the queue is full.
    pub(crate) async fn push(&self, entry: Bytes) -> Result<(), Error> {
        self.tx.send(entry).await.map_err(|_| Error::LogQueueClosed)
    }
}

impl LogWriter {
    /// Waits for the writer to flush everything and exit.
    ///
    /// Blocks the calling thread; every [`LogQueue`] must be dropped first.
    pub(crate) fn join(self) {
        if self.handle.join().is_err() {
            warn!("access log writer panicked");
        }
    }
}

/// One access-log line.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub timestamp: SystemTime,
    pub method: Method,
    pub status: StatusCode,
    pub path: String,
    pub elapsed: Duration,
    pub request_id: String,
}

impl LogRecord {
    /// The line as written to the sink, newline included.
    pub fn encode(&self) -> Bytes {
        Bytes::from(format!("{self}\n"))
    }
}

/// `RFC3339 | portico | METHOD | STATUS | PATH | ELAPSED | REQUEST-ID`
impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | portico | {} | {} | {} | {:?} | {}",
            humantime::format_rfc3339_seconds(self.timestamp),
            self.method,
            self.status.as_u16(),
            self.path,
            self.elapsed,
            self.request_id,
        )
    }
}
