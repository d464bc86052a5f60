//! Test harness for relay integration tests.
//!
//! Provides a TCP echo backend, self-signed certificates, a counting dialer,
//! and an in-memory packet device.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

use sluice_relay::{quic, Dialer, QuicSession, ServerIdentity, TcpDialer, TrustRoots, QUIC_ALPN};

#[allow(dead_code)]
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend that echoes every byte and counts what it saw.
#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    connections: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

#[allow(dead_code)]
impl TcpEchoBackend {
    /// Echo backend on IPv4 loopback.
    pub async fn spawn() -> io::Result<Self> {
        Self::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await
    }

    /// Echo backend on IPv6 loopback. Fails where the host has no `::1`.
    pub async fn spawn_v6() -> io::Result<Self> {
        Self::bind(SocketAddr::from((Ipv6Addr::LOCALHOST, 0))).await
    }

    async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn({
            let connections = Arc::clone(&connections);
            let bytes_received = Arc::clone(&bytes_received);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(echo(stream, Arc::clone(&bytes_received)));
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            bytes_received,
            task,
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Echo until the relay side closes. Bytes are counted before they go back.
async fn echo(mut stream: TcpStream, bytes_received: Arc<AtomicU64>) {
    let mut buf = vec![0u8; 8192];
    while let Ok(n) = stream.read(&mut buf).await {
        if n == 0 {
            break;
        }
        bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        if stream.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
}

#[allow(dead_code)]
/// Address nothing listens on.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[allow(dead_code)]
/// Self-signed certificate for `localhost`.
pub struct TestCerts {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

#[allow(dead_code)]
impl TestCerts {
    pub fn generate() -> Self {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        Self {
            cert_der: cert.cert.der().to_vec(),
            key_der: cert.key_pair.serialize_der(),
        }
    }

    pub fn identity(&self) -> ServerIdentity {
        ServerIdentity::from_der(self.cert_der.clone(), self.key_der.clone())
    }

    pub fn roots(&self) -> TrustRoots {
        TrustRoots::from_der(self.cert_der.clone()).unwrap()
    }

    pub fn server_config(&self, alpn: Option<&[u8]>) -> Arc<rustls::ServerConfig> {
        self.identity().server_config(alpn).unwrap()
    }

    pub fn client_config(&self, alpn: Option<&[u8]>) -> Arc<rustls::ClientConfig> {
        self.roots().client_config(alpn).unwrap()
    }

    /// Client QUIC session to a relay at `remote`.
    pub fn quic_session(&self, remote: SocketAddr) -> Arc<QuicSession> {
        let tls = self.client_config(Some(QUIC_ALPN));
        let config = quic::client_config(&tls, quic::DEFAULT_IDLE_TIMEOUT).unwrap();
        Arc::new(
            QuicSession::new("127.0.0.1:0".parse().unwrap(), remote, "localhost", config).unwrap(),
        )
    }

    /// Connect to a TLS listener.
    pub async fn tls_connect(
        &self,
        addr: SocketAddr,
    ) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let connector = TlsConnector::from(self.client_config(None));
        let stream = TcpStream::connect(addr).await?;
        connector
            .connect(ServerName::try_from("localhost").unwrap(), stream)
            .await
    }
}

#[allow(dead_code)]
/// TCP dialer that counts dial attempts.
#[derive(Default)]
pub struct CountingDialer {
    inner: TcpDialer,
    dials: AtomicU64,
}

#[allow(dead_code)]
impl CountingDialer {
    pub fn dials(&self) -> u64 {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for CountingDialer {
    type Conn = TcpStream;

    async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.inner.dial(addr).await
    }
}

#[allow(dead_code)]
/// In-memory packet device: each read yields one injected packet and each
/// write is captured as one packet.
pub struct PacketDevice {
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
}

#[allow(dead_code)]
/// Test-side ends of a [`PacketDevice`].
pub struct PacketDeviceHandle {
    pub inject: mpsc::UnboundedSender<Vec<u8>>,
    pub captured: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[allow(dead_code)]
pub fn packet_device() -> (PacketDevice, PacketDeviceHandle) {
    let (inject, incoming) = mpsc::unbounded_channel();
    let (outgoing, captured) = mpsc::unbounded_channel();
    (
        PacketDevice { incoming, outgoing },
        PacketDeviceHandle { inject, captured },
    )
}

impl AsyncRead for PacketDevice {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.incoming.poll_recv(cx) {
            Poll::Ready(Some(packet)) => {
                buf.put_slice(&packet);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for PacketDevice {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let _ = self.outgoing.send(buf.to_vec());
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
