//! Error types for the relay.

use std::io;
use std::net::SocketAddr;

use sluice_wire::{HeaderError, ProtoTag};
use thiserror::Error;

use crate::listener::quic::ConnectionId;
use crate::listener::TransportKind;
use crate::tls::TlsError;

/// Errors raised by listeners, sessions and connectors.
///
/// Every variant carries enough context (port, remote peer, connection id) to
/// be logged on its own by the drain task.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {kind} listener on {addr}: {source}")]
    Bind {
        kind: TransportKind,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("tls configuration error: {0}")]
    Tls(#[from] TlsError),

    #[error("accept failed on port {port}: {source}")]
    Accept {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("handshake with {remote} on port {port} failed: {reason}")]
    Handshake {
        port: u16,
        remote: SocketAddr,
        reason: String,
    },

    #[error("bad stream header from {remote} (connection {conn_id}): {source}")]
    Header {
        conn_id: ConnectionId,
        remote: SocketAddr,
        #[source]
        source: HeaderError,
    },

    #[error("no backend for protocol {proto:?} from {remote} (connection {conn_id})")]
    UnknownProto {
        conn_id: ConnectionId,
        remote: SocketAddr,
        proto: ProtoTag,
    },

    #[error("dial to backend {backend} for {remote} on port {port} failed: {source}")]
    Dial {
        port: u16,
        remote: SocketAddr,
        backend: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connection {conn_id} from {remote} lost: {reason}")]
    ConnectionLost {
        conn_id: ConnectionId,
        remote: SocketAddr,
        reason: String,
    },

    #[error("listener on port {port} closed due to shutdown")]
    ListenerShutdown { port: u16 },

    #[error("remote {addr} unavailable: {reason}")]
    Remote { addr: SocketAddr, reason: String },

    #[error("packet device busy, rejected peer {remote}")]
    DeviceBusy { remote: SocketAddr },

    #[error("configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Stable snake_case phase code for logs.
    pub fn phase(&self) -> &'static str {
        match self {
            RelayError::Bind { .. } | RelayError::Tls(_) | RelayError::Config(_) => "startup",
            RelayError::Accept { .. } => "accept",
            RelayError::Handshake { .. } => "handshake",
            RelayError::Header { .. } => "header",
            RelayError::UnknownProto { .. } | RelayError::DeviceBusy { .. } => "routing",
            RelayError::Dial { .. } => "dial",
            RelayError::ConnectionLost { .. } => "connection",
            RelayError::ListenerShutdown { .. } => "shutdown",
            RelayError::Remote { .. } => "remote",
        }
    }

    /// Finer-grained reason code.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::Bind { .. } => "bind_failed",
            RelayError::Tls(e) => e.reason_code(),
            RelayError::Accept { .. } => "accept_failed",
            RelayError::Handshake { .. } => "handshake_failed",
            RelayError::Header { source, .. } => source.reason_code(),
            RelayError::UnknownProto { .. } => "unknown_proto",
            RelayError::Dial { .. } => "dial_failed",
            RelayError::ConnectionLost { .. } => "connection_lost",
            RelayError::ListenerShutdown { .. } => "listener_closed",
            RelayError::Remote { .. } => "remote_unavailable",
            RelayError::DeviceBusy { .. } => "device_busy",
            RelayError::Config(_) => "invalid_config",
        }
    }
}

/// Outcome of a single accept call.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The listening handle was closed by the shutdown watcher.
    #[error("listener closed")]
    Closed,

    #[error("accept error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_message() {
        let err = RelayError::ListenerShutdown { port: 9001 };
        assert_eq!(err.to_string(), "listener on port 9001 closed due to shutdown");
        assert_eq!(err.phase(), "shutdown");
    }

    #[test]
    fn test_header_phase_uses_codec_reason() {
        let err = RelayError::Header {
            conn_id: ConnectionId::generate(),
            remote: "127.0.0.1:5000".parse().unwrap(),
            source: HeaderError::ShortRead {
                received: 3,
                expected: 22,
            },
        };
        assert_eq!(err.phase(), "header");
        assert_eq!(err.reason_code(), "short_read");
    }

    #[test]
    fn test_unknown_proto_is_routing() {
        let err = RelayError::UnknownProto {
            conn_id: ConnectionId::generate(),
            remote: "[::1]:5000".parse().unwrap(),
            proto: "FTP ".parse().unwrap(),
        };
        assert_eq!(err.phase(), "routing");
        assert!(err.to_string().contains("\"FTP \""));
    }
}
