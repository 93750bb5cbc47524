//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the router.
//! All types derive Serde traits for deserialization from TOML, and
//! `PartialEq` so a reload can tell whether anything actually changed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::rules::RuleSyntax;

/// Name of the TLS options and certificate store used when none is given.
pub const DEFAULT_TLS_NAME: &str = "default";

/// Root configuration for the edge router.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listening sockets, by name.
    pub entry_points: BTreeMap<String, EntryPointConfig>,

    /// Raw TCP routing.
    pub tcp: TcpConfig,

    /// HTTP routing behind the forwarders.
    pub http: HttpConfig,

    /// TLS options, certificates and stores.
    pub tls: TlsConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// One listening socket.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EntryPointConfig {
    /// Bind address (e.g., "0.0.0.0:443").
    pub address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// STARTTLS preamble to run before sniffing (e.g., "postgres").
    pub starttls: Option<String>,
}

impl Default for EntryPointConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8443".to_string(),
            max_connections: 10_000,
            starttls: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpConfig {
    pub routers: Vec<TcpRouterConfig>,
    pub services: Vec<TcpServiceConfig>,
}

/// A TCP router: a rule over connection metadata pointing at a service.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TcpRouterConfig {
    pub name: String,

    /// Entry points this router attaches to; empty means all of them.
    #[serde(default)]
    pub entry_points: Vec<String>,

    pub rule: String,

    #[serde(default)]
    pub rule_syntax: RuleSyntax,

    /// Explicit priority; 0 derives it from the rule length.
    #[serde(default)]
    pub priority: i64,

    pub service: String,

    /// Present when the router only handles TLS connections.
    #[serde(default)]
    pub tls: Option<TcpRouterTls>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpRouterTls {
    /// Forward the encrypted stream untouched instead of terminating.
    pub passthrough: bool,

    /// TLS options name; empty means "default".
    pub options: String,
}

/// A TCP backend.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TcpServiceConfig {
    pub name: String,

    /// Backend address (e.g., "127.0.0.1:5432").
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub routers: Vec<HttpRouterConfig>,
    pub services: Vec<HttpServiceConfig>,
}

/// An HTTP router. Only `Host(...)` values of the rule take part in routing.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HttpRouterConfig {
    pub name: String,

    #[serde(default)]
    pub entry_points: Vec<String>,

    pub rule: String,

    #[serde(default)]
    pub priority: i64,

    pub service: String,

    /// Present when the router is served over HTTPS.
    #[serde(default)]
    pub tls: Option<HttpRouterTls>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpRouterTls {
    /// TLS options name; empty means "default".
    pub options: String,
}

/// An HTTP backend.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HttpServiceConfig {
    pub name: String,

    /// Base URL (e.g., "http://127.0.0.1:3000").
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Named TLS options; "default" always exists.
    pub options: BTreeMap<String, TlsOptionsConfig>,

    pub certificates: Vec<CertificateConfig>,

    /// Named certificate stores; "default" always exists.
    pub stores: BTreeMap<String, StoreConfig>,
}

/// Handshake parameters for one options name.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsOptionsConfig {
    /// "VersionTLS12" or "VersionTLS13" ("1.2"/"1.3" also accepted).
    pub min_version: String,

    /// Empty means the highest supported version.
    pub max_version: String,

    /// IANA names of allowed TLS 1.2 suites; empty allows all.
    pub cipher_suites: Vec<String>,

    pub alpn_protocols: Vec<String>,

    /// Refuse handshakes that match no certificate instead of serving the default.
    pub sni_strict: bool,
}

impl Default for TlsOptionsConfig {
    fn default() -> Self {
        Self {
            min_version: "VersionTLS12".to_string(),
            max_version: String::new(),
            cipher_suites: Vec::new(),
            alpn_protocols: vec!["h2".to_string(), "http/1.1".to_string()],
            sni_strict: false,
        }
    }
}

/// A certificate and key, each given as a file path or inline PEM.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CertificateConfig {
    pub cert_file: String,

    pub key_file: String,

    /// Stores this certificate joins; empty means "default".
    #[serde(default)]
    pub stores: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Served when nothing else matches; self-signed when absent.
    pub default_certificate: Option<DefaultCertificateConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DefaultCertificateConfig {
    pub cert_file: String,
    pub key_file: String,
}

/// Timeout configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Backend connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// HTTP request timeout (total time for request/response) in seconds.
    pub request_secs: u64,

    /// How long to wait for a ClientHello before treating the connection as plain TCP.
    pub hello_timeout_ms: u64,

    /// Drain deadline for in-flight connections on shutdown, in seconds.
    pub shutdown_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            request_secs: 30,
            hello_timeout_ms: 2_000,
            shutdown_secs: 30,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// "pretty" for development, "json" for production.
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl HttpRouterTls {
    pub fn options_name(&self) -> &str {
        non_empty_or_default(&self.options)
    }
}

impl TcpRouterTls {
    pub fn options_name(&self) -> &str {
        non_empty_or_default(&self.options)
    }
}

fn non_empty_or_default(name: &str) -> &str {
    if name.is_empty() {
        DEFAULT_TLS_NAME
    } else {
        name
    }
}
