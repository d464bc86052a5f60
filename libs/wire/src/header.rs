//! The 22-byte stream header.

use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::HeaderError;
use crate::tag::ProtoTag;

/// Encoded header length: 4 tag + 16 address + 2 port.
pub const HEADER_LEN: usize = 22;

const ADDR_OFFSET: usize = ProtoTag::LEN;
const PORT_OFFSET: usize = ADDR_OFFSET + 16;

/// Header written as the first bytes of every multiplexed stream.
///
/// `addr` and `port` travel for forward compatibility. Routing on the
/// receiving side only looks at `proto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    /// Backend protocol tag.
    pub proto: ProtoTag,
    /// Address, IPv4 carried as IPv4-mapped IPv6.
    pub addr: Ipv6Addr,
    /// Port, big-endian on the wire.
    pub port: u16,
}

impl WireHeader {
    /// Create a header. IPv4 addresses are stored IPv4-mapped.
    pub fn new(proto: ProtoTag, addr: IpAddr, port: u16) -> Self {
        let addr = match addr {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self { proto, addr, port }
    }

    /// Address with IPv4-mapped values unwrapped back to IPv4.
    pub fn ip(&self) -> IpAddr {
        match self.addr.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(self.addr),
        }
    }

    /// Address and port as a socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip(), self.port)
    }

    /// Encode to the fixed wire layout.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..ADDR_OFFSET].copy_from_slice(self.proto.as_bytes());
        buf[ADDR_OFFSET..PORT_OFFSET].copy_from_slice(&self.addr.octets());
        buf[PORT_OFFSET..].copy_from_slice(&self.port.to_be_bytes());
        buf
    }

    /// Decode a complete header.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, HeaderError> {
        let mut tag = [0u8; ProtoTag::LEN];
        tag.copy_from_slice(&buf[..ADDR_OFFSET]);
        let proto = ProtoTag::from_bytes(tag)?;

        let mut octets = [0u8; 16];
        octets.copy_from_slice(&buf[ADDR_OFFSET..PORT_OFFSET]);

        let port = u16::from_be_bytes([buf[PORT_OFFSET], buf[PORT_OFFSET + 1]]);

        Ok(Self {
            proto,
            addr: Ipv6Addr::from(octets),
            port,
        })
    }

    /// Read exactly one header from `reader`.
    ///
    /// No field is interpreted until all 22 bytes have arrived. If the peer
    /// closes first the result is [`HeaderError::ShortRead`]. Bytes after the
    /// header are left unread.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, HeaderError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = [0u8; HEADER_LEN];
        let mut received = 0;

        while received < HEADER_LEN {
            let n = reader.read(&mut buf[received..]).await?;
            if n == 0 {
                return Err(HeaderError::ShortRead {
                    received,
                    expected: HEADER_LEN,
                });
            }
            received += n;
        }

        Self::decode(&buf)
    }

    /// Write the encoded header with a single `write_all`.
    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        writer.write_all(&self.encode()).await
    }
}
