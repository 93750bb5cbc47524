//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Routed connection (plain, or TLS-terminated with TlsInfo)
//!     → forwarder.rs (hyper-util HTTP/1.1 + HTTP/2 server, ConnectionInfo extension)
//!     → tower-http layers (trace, x-request-id, timeout)
//!     → domain_fronting.rs (HTTPS only: SNI vs Host options check, 421)
//!     → proxy.rs (Host → service, forward with the pooled client)
//!     → Send to client
//! ```

pub mod domain_fronting;
pub mod forwarder;
pub mod proxy;

pub use domain_fronting::{HostHints, TlsOptionsForHost};
pub use forwarder::{build_app, ConnectionInfo, HttpForwarder};
pub use proxy::{HostRoutes, ProxyState, RouteError};

use axum::http::{header, Request};

/// Host the client addressed: `Host` header, else URI authority, without port.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))?;
    let host = strip_port(raw.trim());
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}
