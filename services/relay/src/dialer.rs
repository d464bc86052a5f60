//! Backend dialing.
//!
//! Listeners dial through the [`Dialer`] trait so tests can substitute a
//! counting or failing implementation.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sluice_wire::ProtoTag;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::routes::RouteTable;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens outbound byte-stream connections.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn dial(&self, addr: SocketAddr) -> io::Result<Self::Conn>;
}

/// TCP dialer with a connect timeout.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Conn = TcpStream;

    async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {addr} timed out"),
                ))
            }
        };

        // Interactive traffic (ssh) suffers under Nagle.
        stream.set_nodelay(true)?;
        debug!(backend = %addr, "Connected to backend");
        Ok(stream)
    }
}

/// Resolves protocol tags through a route table and dials the result.
pub struct BackendDialer<D = TcpDialer> {
    routes: Arc<RouteTable>,
    dialer: Arc<D>,
}

impl<D: Dialer> BackendDialer<D> {
    pub fn new(routes: Arc<RouteTable>, dialer: Arc<D>) -> Self {
        Self { routes, dialer }
    }

    /// Backend address for `proto`, if routed.
    pub fn resolve(&self, proto: &ProtoTag) -> Option<SocketAddr> {
        self.routes.lookup(proto)
    }

    pub async fn dial(&self, backend: SocketAddr) -> io::Result<D::Conn> {
        self.dialer.dial(backend).await
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }
}

impl<D> Clone for BackendDialer<D> {
    fn clone(&self) -> Self {
        Self {
            routes: Arc::clone(&self.routes),
            dialer: Arc::clone(&self.dialer),
        }
    }
}
