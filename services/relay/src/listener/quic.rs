//! QUIC listener and multiplexed connection manager.
//!
//! Each accepted connection gets its own task which completes the handshake,
//! assigns a [`ConnectionId`] and then accepts bidirectional streams until the
//! connection ends. Every stream starts with a [`WireHeader`] naming the
//! backend; the stream is then bridged to a fresh backend connection.
//!
//! Connection lifecycle:
//! ```text
//! Accepted --handshake--> AcceptingStreams --accept_bi error--> Closed
//! ```
//! Reaching `Closed` does not cancel streams that are still bridging.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quinn::{ConnectionError, Endpoint, Incoming, VarInt};
use sluice_wire::WireHeader;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use super::{run_accept_loop, Acceptor, CloseFlag, ListenerStats, TransportKind};
use crate::bridge::bridge;
use crate::dialer::{BackendDialer, Dialer, TcpDialer};
use crate::error::{AcceptError, RelayError};
use crate::quic::{self as transport, QuicStream, DEFAULT_IDLE_TIMEOUT};
use crate::shutdown::{Closeable, ErrorReporter};

/// Application close code used when the listener shuts down.
const SHUTDOWN_CODE: VarInt = VarInt::from_u32(0);

/// Random 128-bit identifier assigned to each accepted QUIC connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of one QUIC connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    AcceptingStreams,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Accepted => write!(f, "accepted"),
            ConnectionState::AcceptingStreams => write!(f, "accepting_streams"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Per-connection metadata handed to every stream task.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub remote: SocketAddr,
    pub local_port: u16,
}

/// What closing the listener does to live connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum DrainPolicy {
    /// Stop accepting connections; live connections and streams finish.
    #[default]
    Drain,
    /// Close the endpoint, cutting every live connection.
    ForceClose,
}

/// Configuration for a QUIC listener.
#[derive(Debug, Clone)]
pub struct QuicListenerConfig {
    pub bind_addr: SocketAddr,
    pub idle_timeout: Duration,
    pub drain_policy: DrainPolicy,
}

impl QuicListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            drain_policy: DrainPolicy::default(),
        }
    }
}

struct EndpointCloser {
    endpoint: Endpoint,
    policy: DrainPolicy,
    flag: CloseFlag,
}

impl Closeable for EndpointCloser {
    fn close(&self) -> Result<(), RelayError> {
        match self.policy {
            DrainPolicy::Drain => self.endpoint.set_server_config(None),
            DrainPolicy::ForceClose => self.endpoint.close(SHUTDOWN_CODE, b"shutdown"),
        }
        self.flag.set();
        Ok(())
    }
}

/// Accept side of a QUIC endpoint.
pub(crate) struct QuicAcceptor {
    endpoint: Endpoint,
    port: u16,
    flag: CloseFlag,
}

impl QuicAcceptor {
    pub(crate) fn new(endpoint: Endpoint, port: u16, flag: CloseFlag) -> Self {
        Self {
            endpoint,
            port,
            flag,
        }
    }
}

#[async_trait]
impl Acceptor for QuicAcceptor {
    type Conn = Incoming;

    async fn accept(&mut self) -> Result<(Incoming, SocketAddr), AcceptError> {
        match self.flag.run_until_set(self.endpoint.accept()).await {
            Some(Some(incoming)) => {
                let remote = incoming.remote_address();
                Ok((incoming, remote))
            }
            // `None` from the endpoint means it was closed underneath us.
            Some(None) | None => Err(AcceptError::Closed),
        }
    }

    fn port(&self) -> u16 {
        self.port
    }
}

/// Bind a QUIC server endpoint, mapping failures to a startup error.
pub(crate) fn bind_endpoint(
    bind_addr: SocketAddr,
    tls: &rustls::ServerConfig,
    idle_timeout: Duration,
) -> Result<(Endpoint, u16), RelayError> {
    let server_config = transport::server_config(tls, idle_timeout)?;
    let bind_err = move |source: io::Error| RelayError::Bind {
        kind: TransportKind::Quic,
        addr: bind_addr,
        source,
    };

    let endpoint = Endpoint::server(server_config, bind_addr).map_err(bind_err)?;
    let port = endpoint.local_addr().map_err(bind_err)?.port();
    Ok((endpoint, port))
}

/// Closer for a QUIC endpoint under the given policy.
pub(crate) fn endpoint_closer(
    endpoint: &Endpoint,
    policy: DrainPolicy,
    flag: &CloseFlag,
) -> Arc<dyn Closeable> {
    Arc::new(EndpointCloser {
        endpoint: endpoint.clone(),
        policy,
        flag: flag.clone(),
    })
}

/// QUIC listener routing streams by protocol tag.
pub struct QuicListener<D = TcpDialer> {
    config: QuicListenerConfig,
    endpoint: Endpoint,
    port: u16,
    flag: CloseFlag,
    backends: BackendDialer<D>,
    stats: Arc<ListenerStats>,
}

impl<D: Dialer> QuicListener<D> {
    /// Bind the endpoint. `tls` must advertise the relay ALPN.
    pub fn bind(
        config: QuicListenerConfig,
        tls: &rustls::ServerConfig,
        backends: BackendDialer<D>,
    ) -> Result<Self, RelayError> {
        let (endpoint, port) = bind_endpoint(config.bind_addr, tls, config.idle_timeout)?;
        debug!(
            bind_addr = %config.bind_addr,
            routes = backends.routes().len(),
            drain_policy = ?config.drain_policy,
            "QUIC listener bound"
        );

        Ok(Self {
            config,
            endpoint,
            port,
            flag: CloseFlag::new(),
            backends,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Bound port. Resolved when binding to port 0.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Handle the shutdown watcher uses to stop accepting.
    pub fn closer(&self) -> Arc<dyn Closeable> {
        endpoint_closer(&self.endpoint, self.config.drain_policy, &self.flag)
    }

    /// Counters shared with every session of this listener.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until the listener is closed.
    pub async fn serve(self, reporter: ErrorReporter) {
        let port = self.port;
        let stats = Arc::clone(&self.stats);
        let shared = Arc::new(Shared {
            port,
            backends: self.backends,
            stats: Arc::clone(&self.stats),
            reporter: reporter.clone(),
        });
        let acceptor = QuicAcceptor::new(self.endpoint, port, self.flag);

        run_accept_loop(acceptor, &reporter, |incoming, remote| {
            stats.accepted.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(manage_connection(incoming, remote, Arc::clone(&shared)));
        })
        .await;

        stats.log_summary(port, TransportKind::Quic);
    }
}

/// State shared by every connection on a listener.
struct Shared<D> {
    port: u16,
    backends: BackendDialer<D>,
    stats: Arc<ListenerStats>,
    reporter: ErrorReporter,
}

async fn manage_connection<D: Dialer>(
    incoming: Incoming,
    remote: SocketAddr,
    shared: Arc<Shared<D>>,
) {
    debug!(remote = %remote, state = %ConnectionState::Accepted, "Incoming connection");

    let connection = match incoming.await {
        Ok(connection) => connection,
        Err(e) => {
            shared.stats.handshake_failed.fetch_add(1, Ordering::Relaxed);
            shared.reporter.report(RelayError::Handshake {
                port: shared.port,
                remote,
                reason: e.to_string(),
            });
            return;
        }
    };

    let ctx = ConnectionContext {
        id: ConnectionId::generate(),
        remote,
        local_port: shared.port,
    };
    let span = info_span!("connection", conn_id = %ctx.id, remote = %remote);

    async move {
        info!(state = %ConnectionState::AcceptingStreams, "Connection established");

        let reason = loop {
            match connection.accept_bi().await {
                Ok((send, recv)) => {
                    shared.stats.streams.fetch_add(1, Ordering::Relaxed);
                    let stream = QuicStream::new(send, recv);
                    let stream_id = stream.id();
                    tokio::spawn(
                        handle_stream(ctx, stream, Arc::clone(&shared))
                            .instrument(info_span!("stream", id = %stream_id)),
                    );
                }
                Err(e) => break e,
            }
        };

        match &reason {
            ConnectionError::ApplicationClosed(_) | ConnectionError::LocallyClosed => {
                debug!(reason = %reason, "Connection closed");
            }
            other => {
                shared.reporter.report(RelayError::ConnectionLost {
                    conn_id: ctx.id,
                    remote: ctx.remote,
                    reason: other.to_string(),
                });
            }
        }

        info!(state = %ConnectionState::Closed, "Connection finished");
    }
    .instrument(span)
    .await;
}

async fn handle_stream<D: Dialer>(
    ctx: ConnectionContext,
    mut stream: QuicStream,
    shared: Arc<Shared<D>>,
) {
    let header = match WireHeader::read_from(&mut stream).await {
        Ok(header) => header,
        Err(source) => {
            shared.stats.header_errors.fetch_add(1, Ordering::Relaxed);
            shared.reporter.report(RelayError::Header {
                conn_id: ctx.id,
                remote: ctx.remote,
                source,
            });
            stream.close();
            return;
        }
    };

    let Some(backend) = shared.backends.resolve(&header.proto) else {
        shared.stats.routing_errors.fetch_add(1, Ordering::Relaxed);
        shared.reporter.report(RelayError::UnknownProto {
            conn_id: ctx.id,
            remote: ctx.remote,
            proto: header.proto,
        });
        stream.close();
        return;
    };

    debug!(
        proto = %header.proto,
        backend = %backend,
        origin = %header.socket_addr(),
        "Routing stream"
    );

    let outbound = match shared.backends.dial(backend).await {
        Ok(outbound) => outbound,
        Err(source) => {
            shared.stats.dial_failed.fetch_add(1, Ordering::Relaxed);
            shared.reporter.report(RelayError::Dial {
                port: ctx.local_port,
                remote: ctx.remote,
                backend,
                source,
            });
            stream.close();
            return;
        }
    };

    shared.stats.session_started();
    let result = bridge(stream, outbound).await;
    shared.stats.session_finished(result.a_to_b, result.b_to_a);
    debug!(
        bytes_to_backend = result.a_to_b,
        bytes_from_backend = result.b_to_a,
        "Stream closed"
    );
}
