//! Protocol tag to backend address routing.
//!
//! The table is built once at startup and shared read-only behind an `Arc`.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use serde::Deserialize;
use sluice_wire::ProtoTag;

use crate::error::RelayError;

/// Default HTTP backend.
pub const DEFAULT_HTTP_BACKEND: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080));

/// Default SSH backend.
pub const DEFAULT_SSH_BACKEND: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 22));

/// Maps protocol tags to backend socket addresses.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<ProtoTag, SocketAddr>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouteFile {
    #[serde(rename = "route", default)]
    routes: Vec<RouteEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouteEntry {
    proto: String,
    backend: SocketAddr,
}

impl RouteTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the built-in HTTP and SSH backends.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.insert(ProtoTag::HTTP, DEFAULT_HTTP_BACKEND);
        table.insert(ProtoTag::SSH, DEFAULT_SSH_BACKEND);
        table
    }

    /// Parse a TOML route file.
    ///
    /// ```toml
    /// [[route]]
    /// proto = "SSH "
    /// backend = "127.0.0.1:22"
    /// ```
    pub fn from_toml_str(input: &str) -> Result<Self, RelayError> {
        let file: RouteFile = toml::from_str(input)
            .map_err(|e| RelayError::Config(format!("invalid route file: {e}")))?;

        let mut table = Self::new();
        for entry in file.routes {
            let proto: ProtoTag = entry
                .proto
                .parse()
                .map_err(|e| RelayError::Config(format!("route {:?}: {e}", entry.proto)))?;

            if table.insert(proto, entry.backend).is_some() {
                return Err(RelayError::Config(format!(
                    "duplicate route for protocol {proto:?}"
                )));
            }
        }

        Ok(table)
    }

    /// Add or replace a route, returning the previous backend.
    pub fn insert(&mut self, proto: ProtoTag, backend: SocketAddr) -> Option<SocketAddr> {
        self.routes.insert(proto, backend)
    }

    /// Look up a backend. Tags are matched byte-exact.
    pub fn lookup(&self, proto: &ProtoTag) -> Option<SocketAddr> {
        self.routes.get(proto).copied()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ProtoTag, &SocketAddr)> {
        self.routes.iter()
    }
}
