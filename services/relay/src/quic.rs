//! QUIC plumbing shared by the server listener and the client connector.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{IdleTimeout, TransportConfig, VarInt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::RelayError;
use crate::tls::TlsError;

/// Default QUIC max idle timeout.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-connection datagram buffer, in bytes.
const DATAGRAM_BUFFER_SIZE: usize = 1024 * 1024;

/// Application error code sent when a stream is abandoned.
const STREAM_CLOSED: VarInt = VarInt::from_u32(0);

/// One bidirectional QUIC stream as a tokio duplex.
#[derive(Debug)]
pub struct QuicStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl QuicStream {
    pub fn new(send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
        Self { send, recv }
    }

    pub fn id(&self) -> quinn::StreamId {
        self.send.id()
    }

    /// Finish the send side and stop the receive side. Safe to call on a
    /// stream the peer already closed.
    pub fn close(&mut self) {
        let _ = self.send.finish();
        let _ = self.recv.stop(STREAM_CLOSED);
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

fn transport_config(
    idle_timeout: Duration,
    keep_alive: Option<Duration>,
) -> Result<TransportConfig, RelayError> {
    let idle = IdleTimeout::try_from(idle_timeout)
        .map_err(|e| RelayError::Config(format!("idle timeout {idle_timeout:?}: {e}")))?;

    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(idle));
    transport.keep_alive_interval(keep_alive);
    transport.datagram_receive_buffer_size(Some(DATAGRAM_BUFFER_SIZE));
    transport.datagram_send_buffer_size(DATAGRAM_BUFFER_SIZE);
    Ok(transport)
}

/// Build a quinn server config from a TLS 1.3 rustls config.
pub fn server_config(
    tls: &rustls::ServerConfig,
    idle_timeout: Duration,
) -> Result<quinn::ServerConfig, RelayError> {
    let crypto =
        QuicServerConfig::try_from(tls.clone()).map_err(|e| TlsError::Quic(e.to_string()))?;

    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(Arc::new(transport_config(idle_timeout, None)?));
    Ok(config)
}

/// Build a quinn client config. Keep-alives run at a third of the idle
/// timeout so an otherwise quiet tunnel stays open.
pub fn client_config(
    tls: &rustls::ClientConfig,
    idle_timeout: Duration,
) -> Result<quinn::ClientConfig, RelayError> {
    let crypto =
        QuicClientConfig::try_from(tls.clone()).map_err(|e| TlsError::Quic(e.to_string()))?;

    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(Arc::new(transport_config(
        idle_timeout,
        Some(idle_timeout / 3),
    )?));
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::{ServerIdentity, TrustRoots, QUIC_ALPN};

    #[test]
    fn test_configs_build() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let identity =
            ServerIdentity::from_der(cert.cert.der().to_vec(), cert.key_pair.serialize_der());
        let roots = TrustRoots::from_der(cert.cert.der().to_vec()).unwrap();

        let server_tls = identity.server_config(Some(QUIC_ALPN)).unwrap();
        let client_tls = roots.client_config(Some(QUIC_ALPN)).unwrap();

        server_config(&server_tls, DEFAULT_IDLE_TIMEOUT).unwrap();
        client_config(&client_tls, DEFAULT_IDLE_TIMEOUT).unwrap();
    }

    #[test]
    fn test_idle_timeout_out_of_range() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let identity =
            ServerIdentity::from_der(cert.cert.der().to_vec(), cert.key_pair.serialize_der());
        let server_tls = identity.server_config(Some(QUIC_ALPN)).unwrap();

        let err = server_config(&server_tls, Duration::from_secs(u64::MAX / 1000)).unwrap_err();
        assert_eq!(err.phase(), "startup");
    }
}
