//! Client side: accept local application connections and carry them to the
//! remote relay over the configured transport.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use quinn::{Connection, Endpoint, VarInt};
use rustls::pki_types::ServerName;
use sluice_wire::{ProtoTag, WireHeader};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, info_span, Instrument};

use crate::bridge::{bridge, BridgeStats};
use crate::dialer::{Dialer, TcpDialer};
use crate::error::RelayError;
use crate::listener::{run_accept_loop, Acceptor, ListenerStats, TcpAcceptor, TransportKind};
use crate::quic::QuicStream;
use crate::shutdown::{Closeable, ErrorReporter};

/// Default local port for the client listener.
pub const DEFAULT_LOCAL_PORT: u16 = 2022;

/// Protocol carried by a well-known local listening port.
pub fn proto_for_port(port: u16) -> Option<ProtoTag> {
    match port {
        2022 => Some(ProtoTag::HTTP),
        2024 => Some(ProtoTag::SSH),
        _ => None,
    }
}

fn remote_err(addr: SocketAddr) -> impl FnOnce(io::Error) -> RelayError {
    move |e| RelayError::Remote {
        addr,
        reason: e.to_string(),
    }
}

/// Shared QUIC connection to the remote relay.
///
/// The connection is opened on first use and reopened once it has closed.
/// Every tunneled session gets its own bidirectional stream.
pub struct QuicSession {
    endpoint: Endpoint,
    remote: SocketAddr,
    server_name: String,
    local_port: u16,
    connection: Mutex<Option<Connection>>,
}

impl QuicSession {
    pub fn new(
        bind_addr: SocketAddr,
        remote: SocketAddr,
        server_name: &str,
        config: quinn::ClientConfig,
    ) -> Result<Self, RelayError> {
        let bind_err = move |source: io::Error| RelayError::Bind {
            kind: TransportKind::Quic,
            addr: bind_addr,
            source,
        };

        let mut endpoint = Endpoint::client(bind_addr).map_err(bind_err)?;
        endpoint.set_default_client_config(config);
        let local_port = endpoint.local_addr().map_err(bind_err)?.port();

        Ok(Self {
            endpoint,
            remote,
            server_name: server_name.to_string(),
            local_port,
            connection: Mutex::new(None),
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Local UDP port of the client endpoint.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Current connection, dialing a new one if there is none or it closed.
    pub async fn connection(&self) -> Result<Connection, RelayError> {
        let mut current = self.connection.lock().await;

        if let Some(connection) = current.as_ref() {
            match connection.close_reason() {
                None => return Ok(connection.clone()),
                Some(reason) => debug!(reason = %reason, "QUIC connection closed, reconnecting"),
            }
        }

        let unavailable = |reason: String| RelayError::Remote {
            addr: self.remote,
            reason,
        };
        let connecting = self
            .endpoint
            .connect(self.remote, &self.server_name)
            .map_err(|e| unavailable(e.to_string()))?;
        let connection = connecting.await.map_err(|e| unavailable(e.to_string()))?;

        info!(remote = %self.remote, "QUIC connection established");
        *current = Some(connection.clone());
        Ok(connection)
    }

    /// Open a stream and write its header.
    pub async fn open_stream(&self, proto: ProtoTag) -> Result<QuicStream, RelayError> {
        let connection = self.connection().await?;
        let (send, recv) = connection.open_bi().await.map_err(|e| RelayError::Remote {
            addr: self.remote,
            reason: e.to_string(),
        })?;

        let mut stream = QuicStream::new(send, recv);
        let header = WireHeader::new(proto, self.remote.ip(), self.local_port);
        header
            .write_to(&mut stream)
            .await
            .map_err(remote_err(self.remote))?;

        Ok(stream)
    }

    /// Close the endpoint and every stream on it.
    pub fn close(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"client shutdown");
    }
}

/// How the client reaches the remote relay.
pub enum RemoteTransport {
    Plain {
        addr: SocketAddr,
        dialer: TcpDialer,
    },
    Tls {
        addr: SocketAddr,
        dialer: TcpDialer,
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
    Quic(Arc<QuicSession>),
}

/// Carries one local connection to the remote relay.
pub struct Connector {
    transport: RemoteTransport,
    proto: ProtoTag,
}

impl Connector {
    pub fn plain(addr: SocketAddr) -> Self {
        Self {
            transport: RemoteTransport::Plain {
                addr,
                dialer: TcpDialer::default(),
            },
            proto: ProtoTag::SSH,
        }
    }

    pub fn tls(
        addr: SocketAddr,
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Self {
        Self {
            transport: RemoteTransport::Tls {
                addr,
                dialer: TcpDialer::default(),
                connector: TlsConnector::from(config),
                server_name,
            },
            proto: ProtoTag::SSH,
        }
    }

    /// QUIC connector. `proto` is written into every stream header.
    pub fn quic(session: Arc<QuicSession>, proto: ProtoTag) -> Self {
        Self {
            transport: RemoteTransport::Quic(session),
            proto,
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self.transport {
            RemoteTransport::Plain { .. } => TransportKind::Plain,
            RemoteTransport::Tls { .. } => TransportKind::Tls,
            RemoteTransport::Quic(_) => TransportKind::Quic,
        }
    }

    /// QUIC session, if this connector uses one.
    pub fn quic_session(&self) -> Option<&Arc<QuicSession>> {
        match &self.transport {
            RemoteTransport::Quic(session) => Some(session),
            _ => None,
        }
    }

    /// Dial the remote and bridge `local` to it until either side closes.
    pub async fn connect<S>(&self, local: S) -> Result<BridgeStats, RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match &self.transport {
            RemoteTransport::Plain { addr, dialer } => {
                let remote = dialer.dial(*addr).await.map_err(remote_err(*addr))?;
                Ok(bridge(local, remote).await)
            }
            RemoteTransport::Tls {
                addr,
                dialer,
                connector,
                server_name,
            } => {
                let tcp = dialer.dial(*addr).await.map_err(remote_err(*addr))?;
                let remote = connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .map_err(remote_err(*addr))?;
                Ok(bridge(local, remote).await)
            }
            RemoteTransport::Quic(session) => {
                let remote = session.open_stream(self.proto).await?;
                Ok(bridge(local, remote).await)
            }
        }
    }
}

/// Local accept loop of the client.
pub struct LocalListener {
    acceptor: TcpAcceptor,
    connector: Arc<Connector>,
    stats: Arc<ListenerStats>,
}

impl LocalListener {
    pub async fn bind(addr: SocketAddr, connector: Arc<Connector>) -> Result<Self, RelayError> {
        let acceptor = TcpAcceptor::bind(addr, TransportKind::Plain).await?;
        Ok(Self {
            acceptor,
            connector,
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

    pub async fn serve(self, reporter: ErrorReporter) {
        let Self {
            acceptor,
            connector,
            stats,
        } = self;
        let port = acceptor.port();
        let kind = connector.kind();

        run_accept_loop(acceptor, &reporter, |stream, peer| {
            stats.accepted.fetch_add(1, Ordering::Relaxed);
            let connector = Arc::clone(&connector);
            let stats = Arc::clone(&stats);
            let reporter = reporter.clone();

            tokio::spawn(
                async move {
                    let _ = stream.set_nodelay(true);
                    stats.session_started();
                    match connector.connect(stream).await {
                        Ok(result) => {
                            stats.session_finished(result.a_to_b, result.b_to_a);
                            debug!(
                                bytes_to_remote = result.a_to_b,
                                bytes_from_remote = result.b_to_a,
                                "Session closed"
                            );
                        }
                        Err(e) => {
                            stats.session_finished(0, 0);
                            stats.dial_failed.fetch_add(1, Ordering::Relaxed);
                            reporter.report(e);
                        }
                    }
                }
                .instrument(info_span!("client_session", port, peer = %peer, %kind)),
            );
        })
        .await;

        stats.log_summary(port, kind);
    }
}
