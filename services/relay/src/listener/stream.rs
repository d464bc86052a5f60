//! Plain TCP and TLS listeners.
//!
//! One session per accepted connection: optional TLS handshake, dial the
//! configured backend, bridge. Sessions are unbounded.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info_span, Instrument};

use super::{run_accept_loop, Acceptor, ListenerStats, TcpAcceptor, TransportKind};
use crate::bridge::bridge;
use crate::dialer::{Dialer, TcpDialer};
use crate::error::RelayError;
use crate::routes::DEFAULT_SSH_BACKEND;
use crate::shutdown::{Closeable, ErrorReporter};
use crate::tls::TlsError;

/// Configuration for a plain or TLS listener.
#[derive(Debug, Clone)]
pub struct StreamListenerConfig {
    pub bind_addr: SocketAddr,
    pub kind: TransportKind,
    /// Every session on this listener is forwarded here.
    pub backend: SocketAddr,
}

impl StreamListenerConfig {
    pub fn plain(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            kind: TransportKind::Plain,
            backend: DEFAULT_SSH_BACKEND,
        }
    }

    pub fn tls(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            kind: TransportKind::Tls,
            backend: DEFAULT_SSH_BACKEND,
        }
    }

    pub fn with_backend(mut self, backend: SocketAddr) -> Self {
        self.backend = backend;
        self
    }
}

/// Listener for byte-stream transports.
pub struct StreamListener<D = TcpDialer> {
    config: StreamListenerConfig,
    acceptor: TcpAcceptor,
    tls: Option<TlsAcceptor>,
    dialer: Arc<D>,
    stats: Arc<ListenerStats>,
}

impl<D: Dialer> StreamListener<D> {
    /// Bind the listening socket. TLS listeners require a server config.
    pub async fn bind(
        config: StreamListenerConfig,
        tls: Option<Arc<rustls::ServerConfig>>,
        dialer: Arc<D>,
    ) -> Result<Self, RelayError> {
        let tls = match (config.kind, tls) {
            (TransportKind::Plain, _) => None,
            (TransportKind::Tls, Some(server_config)) => Some(TlsAcceptor::from(server_config)),
            (TransportKind::Tls, None) => {
                return Err(TlsError::Missing("tls server certificate").into());
            }
            (TransportKind::Quic, _) => {
                return Err(RelayError::Config(
                    "quic is not a byte-stream transport".to_string(),
                ));
            }
        };

        let acceptor = TcpAcceptor::bind(config.bind_addr, config.kind).await?;
        debug!(
            bind_addr = %config.bind_addr,
            kind = %config.kind,
            backend = %config.backend,
            "Listener bound"
        );

        Ok(Self {
            config,
            acceptor,
            tls,
            dialer,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Bound port. Resolved when binding to port 0.
    pub fn port(&self) -> u16 {
        self.acceptor.port()
    }

    /// Handle the shutdown watcher uses to stop accepting.
    pub fn closer(&self) -> Arc<dyn Closeable> {
        self.acceptor.closer()
    }

    /// Counters shared with every session of this listener.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept and serve sessions until the listener is closed.
    pub async fn serve(self, reporter: ErrorReporter) {
        let Self {
            config,
            acceptor,
            tls,
            dialer,
            stats,
        } = self;
        let port = acceptor.port();

        run_accept_loop(acceptor, &reporter, |stream, remote| {
            stats.accepted.fetch_add(1, Ordering::Relaxed);

            let session = Session {
                port,
                remote,
                backend: config.backend,
                dialer: Arc::clone(&dialer),
                stats: Arc::clone(&stats),
                reporter: reporter.clone(),
            };
            let tls = tls.clone();

            tokio::spawn(
                async move { session.run(stream, tls).await }
                    .instrument(info_span!("session", port, remote = %remote, kind = %config.kind)),
            );
        })
        .await;

        stats.log_summary(port, config.kind);
    }
}

/// Per-session context.
struct Session<D> {
    port: u16,
    remote: SocketAddr,
    backend: SocketAddr,
    dialer: Arc<D>,
    stats: Arc<ListenerStats>,
    reporter: ErrorReporter,
}

impl<D: Dialer> Session<D> {
    async fn run(self, stream: TcpStream, tls: Option<TlsAcceptor>) {
        let _ = stream.set_nodelay(true);

        match tls {
            None => self.relay(stream).await,
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => self.relay(tls_stream).await,
                Err(e) => {
                    self.stats.handshake_failed.fetch_add(1, Ordering::Relaxed);
                    self.reporter.report(RelayError::Handshake {
                        port: self.port,
                        remote: self.remote,
                        reason: e.to_string(),
                    });
                }
            },
        }
    }

    async fn relay<S>(self, inbound: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let outbound = match self.dialer.dial(self.backend).await {
            Ok(outbound) => outbound,
            Err(source) => {
                self.stats.dial_failed.fetch_add(1, Ordering::Relaxed);
                self.reporter.report(RelayError::Dial {
                    port: self.port,
                    remote: self.remote,
                    backend: self.backend,
                    source,
                });
                // Dropping `inbound` closes the client side.
                return;
            }
        };

        self.stats.session_started();
        let result = bridge(inbound, outbound).await;
        self.stats.session_finished(result.a_to_b, result.b_to_a);
        debug!(
            bytes_to_backend = result.a_to_b,
            bytes_from_backend = result.b_to_a,
            "Session closed"
        );
    }
}
