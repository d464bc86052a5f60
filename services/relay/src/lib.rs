//! sluice relay
//!
//! Tunnels application byte streams between a local client endpoint and a
//! remote server endpoint over plain TCP, TLS or QUIC. The server re-dials a
//! local backend for every session and bridges bytes end to end.
//!
//! QUIC connections multiplex many sessions; each stream starts with a
//! [`WireHeader`](sluice_wire::WireHeader) naming the backend protocol.

pub mod bridge;
pub mod config;
pub mod connector;
pub mod dialer;
pub mod error;
pub mod listener;
pub mod logging;
pub mod packet;
pub mod quic;
pub mod routes;
pub mod shutdown;
pub mod tls;

pub use bridge::{bridge, BridgeStats, CloseOnce, Direction};
pub use connector::{proto_for_port, Connector, LocalListener, QuicSession};
pub use dialer::{BackendDialer, Dialer, TcpDialer};
pub use error::{AcceptError, RelayError};
pub use listener::quic::{
    ConnectionContext, ConnectionId, ConnectionState, DrainPolicy, QuicListener,
    QuicListenerConfig,
};
pub use listener::stream::{StreamListener, StreamListenerConfig};
pub use listener::{ListenerStats, TransportKind};
pub use packet::{forward_packets, PacketStats, TunConnector, TunListener};
pub use routes::RouteTable;
pub use shutdown::{
    Canceller, Closeable, ErrorQueue, ErrorReporter, Shutdown, ShutdownReport, ShutdownSignal,
    Supervisor,
};
pub use tls::{ServerIdentity, TlsError, TrustRoots, QUIC_ALPN};
