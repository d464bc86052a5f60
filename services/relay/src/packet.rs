//! Packet forwarding between a virtual network device and QUIC datagrams.
//!
//! One device read becomes one datagram and one datagram becomes one device
//! write; packets are never merged or split. Creating the device and routing
//! traffic into it happen outside this crate.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use quinn::{Connection, Endpoint, Incoming, SendDatagramError, VarInt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, Instrument};

use crate::bridge::CloseOnce;
use crate::connector::QuicSession;
use crate::error::RelayError;
use crate::listener::quic::{bind_endpoint, endpoint_closer, QuicAcceptor, QuicListenerConfig};
use crate::listener::{run_accept_loop, CloseFlag, ListenerStats, TransportKind};
use crate::shutdown::{Closeable, ErrorReporter};

/// Largest packet read from the device in one call.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Close code sent when the device is already leased.
const BUSY_CODE: VarInt = VarInt::from_u32(1);

const DONE_CODE: VarInt = VarInt::from_u32(0);

/// Packet and byte counts of a finished forwarding session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketStats {
    pub packets_to_peer: u64,
    pub packets_from_peer: u64,
    pub bytes_to_peer: u64,
    pub bytes_from_peer: u64,
}

/// Forward packets between `device` and `connection` until either side stops.
///
/// The first side to stop ends both. The connection is closed on return; the
/// device is left open for the next lease.
pub async fn forward_packets<D>(device: &mut D, connection: &Connection) -> PacketStats
where
    D: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(device);
    let close = CloseOnce::new();

    let to_peer = async {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let (mut packets, mut bytes) = (0u64, 0u64);

        loop {
            let n = tokio::select! {
                biased;
                _ = close.fired() => break,
                result = reader.read(&mut buf) => match result {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!(error = %e, "Device read failed");
                        break;
                    }
                },
            };

            match connection.send_datagram(Bytes::copy_from_slice(&buf[..n])) {
                Ok(()) => {
                    packets += 1;
                    bytes += n as u64;
                }
                Err(SendDatagramError::TooLarge) => {
                    debug!(len = n, "Dropping packet larger than datagram limit");
                }
                Err(e) => {
                    debug!(error = %e, "Datagram send failed");
                    break;
                }
            }
        }

        close.fire();
        (packets, bytes)
    };

    let from_peer = async {
        let (mut packets, mut bytes) = (0u64, 0u64);

        loop {
            let datagram = tokio::select! {
                biased;
                _ = close.fired() => break,
                result = connection.read_datagram() => match result {
                    Ok(datagram) => datagram,
                    Err(e) => {
                        debug!(error = %e, "Datagram read ended");
                        break;
                    }
                },
            };

            let written = tokio::select! {
                biased;
                _ = close.fired() => break,
                result = writer.write_all(&datagram) => result,
            };
            if let Err(e) = written {
                debug!(error = %e, "Device write failed");
                break;
            }
            packets += 1;
            bytes += datagram.len() as u64;
        }

        close.fire();
        (packets, bytes)
    };

    let ((packets_to_peer, bytes_to_peer), (packets_from_peer, bytes_from_peer)) =
        tokio::join!(to_peer, from_peer);

    connection.close(DONE_CODE, b"done");

    PacketStats {
        packets_to_peer,
        packets_from_peer,
        bytes_to_peer,
        bytes_from_peer,
    }
}

/// Server side: leases a single device to one QUIC peer at a time.
pub struct TunListener<D> {
    config: QuicListenerConfig,
    endpoint: Endpoint,
    port: u16,
    flag: CloseFlag,
    device: Arc<Mutex<D>>,
    stats: Arc<ListenerStats>,
}

impl<D> TunListener<D>
where
    D: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn bind(
        config: QuicListenerConfig,
        tls: &rustls::ServerConfig,
        device: D,
    ) -> Result<Self, RelayError> {
        let (endpoint, port) = bind_endpoint(config.bind_addr, tls, config.idle_timeout)?;
        Ok(Self {
            config,
            endpoint,
            port,
            flag: CloseFlag::new(),
            device: Arc::new(Mutex::new(device)),
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

    pub async fn serve(self, reporter: ErrorReporter) {
        let Self {
            endpoint,
            port,
            flag,
            device,
            stats,
            ..
        } = self;
        let acceptor = QuicAcceptor::new(endpoint, port, flag);

        run_accept_loop(acceptor, &reporter, |incoming, remote| {
            stats.accepted.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(
                lease_device(
                    incoming,
                    remote,
                    port,
                    Arc::clone(&device),
                    Arc::clone(&stats),
                    reporter.clone(),
                )
                .instrument(info_span!("tun_peer", port, remote = %remote)),
            );
        })
        .await;

        stats.log_summary(port, TransportKind::Quic);
    }
}

async fn lease_device<D>(
    incoming: Incoming,
    remote: SocketAddr,
    port: u16,
    device: Arc<Mutex<D>>,
    stats: Arc<ListenerStats>,
    reporter: ErrorReporter,
) where
    D: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection = match incoming.await {
        Ok(connection) => connection,
        Err(e) => {
            stats.handshake_failed.fetch_add(1, Ordering::Relaxed);
            reporter.report(RelayError::Handshake {
                port,
                remote,
                reason: e.to_string(),
            });
            return;
        }
    };

    let Ok(mut device) = device.try_lock_owned() else {
        connection.close(BUSY_CODE, b"busy");
        reporter.report(RelayError::DeviceBusy { remote });
        return;
    };

    info!("Device leased");
    stats.session_started();
    let result = forward_packets(&mut *device, &connection).await;
    stats.session_finished(result.bytes_from_peer, result.bytes_to_peer);
    info!(
        packets_to_peer = result.packets_to_peer,
        packets_from_peer = result.packets_from_peer,
        "Device released"
    );
}

/// Client side: forwards a local device over the shared QUIC session.
pub struct TunConnector {
    session: Arc<QuicSession>,
}

impl TunConnector {
    pub fn new(session: Arc<QuicSession>) -> Self {
        Self { session }
    }

    /// Forward until either side stops.
    pub async fn run<D>(&self, device: &mut D) -> Result<PacketStats, RelayError>
    where
        D: AsyncRead + AsyncWrite + Unpin,
    {
        let connection = self.session.connection().await?;
        if connection.max_datagram_size().is_none() {
            return Err(RelayError::Remote {
                addr: self.session.remote(),
                reason: "peer does not accept datagrams".to_string(),
            });
        }
        Ok(forward_packets(device, &connection).await)
    }
}
