//! Per-connection metadata evaluated by matcher trees.

use std::net::SocketAddr;

/// What is known about a connection before any routing decision.
///
/// Built once per accepted connection from the sniffed ClientHello and the
/// peer address, then only read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnData {
    server_name: String,
    remote_ip: String,
    alpn_protocols: Vec<String>,
}

impl ConnData {
    /// Create metadata from an already canonical server name.
    pub fn new(
        server_name: impl Into<String>,
        peer_addr: SocketAddr,
        alpn_protocols: Vec<String>,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            remote_ip: peer_addr.ip().to_string(),
            alpn_protocols,
        }
    }

    /// Metadata for a connection that did not present a ClientHello.
    pub fn plain(peer_addr: SocketAddr) -> Self {
        Self::new(String::new(), peer_addr, Vec::new())
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn remote_ip(&self) -> &str {
        &self.remote_ip
    }

    pub fn alpn_protocols(&self) -> &[String] {
        &self.alpn_protocols
    }
}

/// Canonicalize an SNI value: lowercase and drop one trailing dot (RFC 6066).
pub fn canonical_server_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match lower.strip_suffix('.') {
        Some(trimmed) => trimmed.to_string(),
        None => lower,
    }
}
