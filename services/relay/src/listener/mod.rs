//! Transport listeners.
//!
//! Every listener runs the same accept loop: accept, hand the connection to a
//! new task, continue. The loop ends only when its handle is closed by the
//! shutdown watcher; any other accept error is reported and retried.

pub mod quic;
pub mod stream;

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{AcceptError, RelayError};
use crate::shutdown::{Closeable, ErrorReporter};

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Transport a listener serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum TransportKind {
    /// Plain TCP.
    #[value(name = "tcp")]
    Plain,
    /// TLS over TCP.
    Tls,
    /// QUIC.
    Quic,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Plain => write!(f, "tcp"),
            TransportKind::Tls => write!(f, "tls"),
            TransportKind::Quic => write!(f, "quic"),
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Sessions (plain/TLS) or QUIC connections accepted.
    pub accepted: AtomicU64,
    /// Sessions or streams currently bridging.
    pub active: AtomicU64,
    /// Sessions or streams finished.
    pub closed: AtomicU64,
    /// Handshake failures.
    pub handshake_failed: AtomicU64,
    /// QUIC streams accepted.
    pub streams: AtomicU64,
    /// Streams rejected for a bad header.
    pub header_errors: AtomicU64,
    /// Streams rejected for an unrouted protocol.
    pub routing_errors: AtomicU64,
    /// Backend dial failures.
    pub dial_failed: AtomicU64,
    /// Bytes proxied to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backends.
    pub bytes_from_backend: AtomicU64,
}

impl ListenerStats {
    pub(crate) fn session_started(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_finished(&self, to_backend: u64, from_backend: u64) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.closed.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_backend.fetch_add(to_backend, Ordering::Relaxed);
        self.bytes_from_backend.fetch_add(from_backend, Ordering::Relaxed);
    }

    pub fn log_summary(&self, port: u16, kind: TransportKind) {
        info!(
            port,
            %kind,
            accepted = self.accepted.load(Ordering::Relaxed),
            active = self.active.load(Ordering::Relaxed),
            closed = self.closed.load(Ordering::Relaxed),
            handshake_failed = self.handshake_failed.load(Ordering::Relaxed),
            streams = self.streams.load(Ordering::Relaxed),
            header_errors = self.header_errors.load(Ordering::Relaxed),
            routing_errors = self.routing_errors.load(Ordering::Relaxed),
            dial_failed = self.dial_failed.load(Ordering::Relaxed),
            bytes_to_backend = self.bytes_to_backend.load(Ordering::Relaxed),
            bytes_from_backend = self.bytes_from_backend.load(Ordering::Relaxed),
            "Listener stopped"
        );
    }
}

/// Source of inbound connections for [`run_accept_loop`].
#[async_trait]
pub trait Acceptor: Send {
    type Conn: Send + 'static;

    async fn accept(&mut self) -> Result<(Self::Conn, SocketAddr), AcceptError>;

    fn port(&self) -> u16;
}

/// Accept until the acceptor reports [`AcceptError::Closed`].
///
/// Each accepted connection goes to `dispatch`, which is expected to spawn.
pub async fn run_accept_loop<A, F>(mut acceptor: A, reporter: &ErrorReporter, mut dispatch: F)
where
    A: Acceptor,
    F: FnMut(A::Conn, SocketAddr),
{
    let port = acceptor.port();
    info!(port, "Listener started");

    loop {
        match acceptor.accept().await {
            Ok((conn, remote)) => dispatch(conn, remote),
            Err(AcceptError::Closed) => {
                debug!(port, "Accept loop finished");
                break;
            }
            Err(AcceptError::Io(source)) => {
                reporter.report(RelayError::Accept { port, source });
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Closes an accept handle by flipping its watch flag.
struct FlagCloser {
    tx: Arc<watch::Sender<bool>>,
}

impl Closeable for FlagCloser {
    fn close(&self) -> Result<(), RelayError> {
        self.tx.send_replace(true);
        Ok(())
    }
}

/// Close flag shared between an accept handle and its closer.
#[derive(Debug, Clone)]
pub(crate) struct CloseFlag {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CloseFlag {
    pub(crate) fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub(crate) fn set(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Race `fut` against the flag.
    pub(crate) async fn run_until_set<T, Fut>(&mut self, fut: Fut) -> Option<T>
    where
        Fut: Future<Output = T>,
    {
        if self.is_set() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.rx.changed() => None,
            value = fut => Some(value),
        }
    }

    fn closer(&self) -> Arc<dyn Closeable> {
        Arc::new(FlagCloser {
            tx: Arc::clone(&self.tx),
        })
    }
}

/// Closeable TCP accept handle.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    port: u16,
    flag: CloseFlag,
}

impl TcpAcceptor {
    pub async fn bind(addr: SocketAddr, kind: TransportKind) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { kind, addr, source })?;
        let port = listener
            .local_addr()
            .map_err(|source| RelayError::Bind { kind, addr, source })?
            .port();

        Ok(Self {
            listener,
            port,
            flag: CloseFlag::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle that makes a pending or future accept return [`AcceptError::Closed`].
    pub fn closer(&self) -> Arc<dyn Closeable> {
        self.flag.closer()
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    type Conn = TcpStream;

    async fn accept(&mut self) -> Result<(TcpStream, SocketAddr), AcceptError> {
        match self.flag.run_until_set(self.listener.accept()).await {
            Some(result) => Ok(result?),
            None => Err(AcceptError::Closed),
        }
    }

    fn port(&self) -> u16 {
        self.port
    }
}
