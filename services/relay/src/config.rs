//! Command-line and environment configuration for both binaries.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser};
use sluice_wire::ProtoTag;

use crate::connector::{proto_for_port, DEFAULT_LOCAL_PORT};
use crate::listener::quic::DrainPolicy;
use crate::listener::TransportKind;
use crate::logging::LogFormat;
use crate::routes::{RouteTable, DEFAULT_SSH_BACKEND};
use crate::tls::{ServerIdentity, TlsError, TrustRoots, DEFAULT_SERVER_NAME};

/// Default plain TCP port.
pub const DEFAULT_TCP_PORT: u16 = 9000;
/// Default TLS port.
pub const DEFAULT_TLS_PORT: u16 = 9001;
/// Default QUIC port.
pub const DEFAULT_QUIC_PORT: u16 = 9002;

const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 15;

/// Remote port a client uses for `kind` when none is given.
pub fn default_remote_port(kind: TransportKind) -> u16 {
    match kind {
        TransportKind::Plain => DEFAULT_TCP_PORT,
        TransportKind::Tls => DEFAULT_TLS_PORT,
        TransportKind::Quic => DEFAULT_QUIC_PORT,
    }
}

/// Logging options shared by both binaries.
#[derive(Debug, Clone, Args)]
pub struct LogArgs {
    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error).
    #[arg(long, env = "SLUICE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "SLUICE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// Relay server: terminates tcp, tls and quic tunnels and dials backends.
#[derive(Debug, Clone, Parser)]
#[command(name = "sluice-server", version, about)]
pub struct ServerArgs {
    /// Address every listener binds to.
    #[arg(long, env = "SLUICE_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Plain TCP listener port.
    #[arg(long, env = "SLUICE_TCP_PORT", default_value_t = DEFAULT_TCP_PORT)]
    pub tcp_port: u16,

    /// TLS listener port.
    #[arg(long, env = "SLUICE_TLS_PORT", default_value_t = DEFAULT_TLS_PORT)]
    pub tls_port: u16,

    /// QUIC listener port.
    #[arg(long, env = "SLUICE_QUIC_PORT", default_value_t = DEFAULT_QUIC_PORT)]
    pub quic_port: u16,

    /// Backend for plain and TLS sessions.
    #[arg(long, env = "SLUICE_BACKEND", default_value_t = DEFAULT_SSH_BACKEND)]
    pub backend: SocketAddr,

    /// TOML route table for QUIC streams. Built-in HTTP/SSH routes otherwise.
    #[arg(long, env = "SLUICE_ROUTES")]
    pub routes: Option<PathBuf>,

    /// QUIC max idle timeout in seconds.
    #[arg(long, env = "SLUICE_IDLE_TIMEOUT_SECS", default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    pub idle_timeout_secs: u64,

    /// What shutdown does to live QUIC connections.
    #[arg(long, env = "SLUICE_DRAIN_POLICY", value_enum, default_value_t = DrainPolicy::Drain)]
    pub drain_policy: DrainPolicy,

    /// PEM certificate chain.
    #[arg(long, env = "SERVER_PEM")]
    pub cert: Option<PathBuf>,

    /// PEM private key.
    #[arg(long, env = "SERVER_KEY")]
    pub key: Option<PathBuf>,

    #[command(flatten)]
    pub log: LogArgs,
}

impl ServerArgs {
    pub fn addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.bind, port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Route table from `--routes`, or the built-in defaults.
    pub fn route_table(&self) -> Result<RouteTable> {
        match &self.routes {
            Some(path) => load_routes(path),
            None => Ok(RouteTable::with_defaults()),
        }
    }

    /// Server certificate and key. Both are required.
    pub fn identity(&self) -> Result<ServerIdentity> {
        let cert = self
            .cert
            .as_deref()
            .ok_or(TlsError::Missing("server certificate (--cert or SERVER_PEM)"))?;
        let key = self
            .key
            .as_deref()
            .ok_or(TlsError::Missing("server key (--key or SERVER_KEY)"))?;

        ServerIdentity::from_pem_files(cert, key).context("failed to load server identity")
    }
}

fn load_routes(path: &Path) -> Result<RouteTable> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read route file {}", path.display()))?;
    let table = RouteTable::from_toml_str(&contents)
        .with_context(|| format!("invalid route file {}", path.display()))?;

    if table.is_empty() {
        return Err(anyhow!("route file {} defines no routes", path.display()));
    }
    Ok(table)
}

/// Relay client: accepts local connections and tunnels them to a server.
#[derive(Debug, Clone, Parser)]
#[command(name = "sluice-client", version, about)]
pub struct ClientArgs {
    /// Local port to accept application connections on.
    #[arg(short = 'p', long = "port", env = "SLUICE_LOCAL_PORT", default_value_t = DEFAULT_LOCAL_PORT)]
    pub port: u16,

    /// Remote server host.
    #[arg(long, env = "SLUICE_ADDR", default_value = "localhost")]
    pub addr: String,

    /// Transport to the server.
    #[arg(long, env = "SLUICE_MODE", value_enum, default_value_t = TransportKind::Tls)]
    pub mode: TransportKind,

    /// PEM trust root for the server certificate.
    #[arg(long, env = "CA_CERT_LOC")]
    pub ca: Option<PathBuf>,

    /// Expected server certificate name.
    #[arg(long, env = "SLUICE_SERVER_NAME", default_value = DEFAULT_SERVER_NAME)]
    pub server_name: String,

    /// 4-byte protocol tag for QUIC streams. Derived from the local port otherwise.
    #[arg(long, env = "SLUICE_PROTO")]
    pub proto: Option<ProtoTag>,

    /// Remote port. Defaults to the server's port for the selected mode.
    #[arg(long, env = "SLUICE_REMOTE_PORT")]
    pub remote_port: Option<u16>,

    /// QUIC max idle timeout in seconds.
    #[arg(long, env = "SLUICE_IDLE_TIMEOUT_SECS", default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    pub idle_timeout_secs: u64,

    #[command(flatten)]
    pub log: LogArgs,
}

impl ClientArgs {
    pub fn remote_port(&self) -> u16 {
        self.remote_port
            .unwrap_or_else(|| default_remote_port(self.mode))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port)
    }

    /// Stream protocol: `--proto`, else the protocol of the local port.
    pub fn proto(&self) -> Result<ProtoTag> {
        self.proto.or_else(|| proto_for_port(self.port)).ok_or_else(|| {
            anyhow!(
                "no protocol known for local port {}; pass --proto",
                self.port
            )
        })
    }

    pub fn trust_roots(&self) -> Result<TrustRoots> {
        let ca = self
            .ca
            .as_deref()
            .ok_or(TlsError::Missing("trust root (--ca or CA_CERT_LOC)"))?;
        TrustRoots::from_pem_file(ca).context("failed to load trust root")
    }

    /// Resolve the server address.
    pub async fn resolve_remote(&self) -> Result<SocketAddr> {
        let port = self.remote_port();
        let mut addrs = tokio::net::lookup_host((self.addr.as_str(), port))
            .await
            .with_context(|| format!("failed to resolve {}:{port}", self.addr))?;
        addrs
            .next()
            .ok_or_else(|| anyhow!("{}:{port} resolved to no addresses", self.addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    #[test]
    fn test_server_defaults() {
        let args = ServerArgs::try_parse_from(["sluice-server"]).unwrap();
        assert_eq!(args.tcp_port, 9000);
        assert_eq!(args.tls_port, 9001);
        assert_eq!(args.quic_port, 9002);
        assert_eq!(args.backend, "127.0.0.1:22".parse().unwrap());
        assert_eq!(args.idle_timeout(), Duration::from_secs(15));
        assert_eq!(args.drain_policy, DrainPolicy::Drain);
        assert_eq!(args.route_table().unwrap().len(), 2);
    }

    #[test]
    fn test_server_force_close() {
        let args =
            ServerArgs::try_parse_from(["sluice-server", "--drain-policy", "force-close"]).unwrap();
        assert_eq!(args.drain_policy, DrainPolicy::ForceClose);
    }

    #[test]
    fn test_server_missing_cert() {
        let args = ServerArgs::try_parse_from(["sluice-server", "--key", "/tmp/key.pem"]).unwrap();
        if args.cert.is_none() {
            let err = args.identity().unwrap_err();
            assert!(err.to_string().contains("server certificate"));
        }
    }

    #[test]
    fn test_server_routes_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[[route]]\nproto = \"SSH \"\nbackend = \"127.0.0.1:2222\""
        )
        .unwrap();

        let args = ServerArgs::try_parse_from([
            "sluice-server",
            "--routes",
            file.path().to_str().unwrap(),
        ])
        .unwrap();
        let table = args.route_table().unwrap();
        assert_eq!(
            table.lookup(&ProtoTag::SSH),
            Some("127.0.0.1:2222".parse().unwrap())
        );
    }

    #[test]
    fn test_server_empty_routes_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let args = ServerArgs::try_parse_from([
            "sluice-server",
            "--routes",
            file.path().to_str().unwrap(),
        ])
        .unwrap();
        assert!(args.route_table().is_err());
    }

    #[rstest]
    #[case("tcp", 9000)]
    #[case("tls", 9001)]
    #[case("quic", 9002)]
    fn test_client_remote_port_per_mode(#[case] mode: &str, #[case] port: u16) {
        let args = ClientArgs::try_parse_from(["sluice-client", "--mode", mode]).unwrap();
        assert_eq!(args.remote_port(), port);
    }

    #[test]
    fn test_client_explicit_remote_port() {
        let args =
            ClientArgs::try_parse_from(["sluice-client", "--mode", "quic", "--remote-port", "443"])
                .unwrap();
        assert_eq!(args.mode, TransportKind::Quic);
        assert_eq!(args.remote_port(), 443);
    }

    #[rstest]
    #[case(&["sluice-client"], Some(ProtoTag::HTTP))]
    #[case(&["sluice-client", "-p", "2024"], Some(ProtoTag::SSH))]
    #[case(&["sluice-client", "-p", "3000"], None)]
    #[case(&["sluice-client", "-p", "3000", "--proto", "SSH "], Some(ProtoTag::SSH))]
    fn test_client_proto(#[case] argv: &[&str], #[case] expected: Option<ProtoTag>) {
        let args = ClientArgs::try_parse_from(argv).unwrap();
        assert_eq!(args.proto().ok(), expected);
    }

    #[test]
    fn test_client_rejects_bad_proto() {
        assert!(ClientArgs::try_parse_from(["sluice-client", "--proto", "SSH"]).is_err());
    }

    #[test]
    fn test_client_rejects_unknown_mode() {
        assert!(ClientArgs::try_parse_from(["sluice-client", "--mode", "udp"]).is_err());
    }
}
