//! TLS subsystem.
//!
//! # Data Flow
//! ```text
//! [tls] config section
//!     → certificate.rs (PEM file or inline → CertificateEntry, SANs, domain key)
//!     → store.rs (per-store dynamic map + default + match cache)
//!     → manager.rs (named stores and options, swapped on reload)
//!
//! Handshake:
//!     TlsManager::get(store, options) → rustls ServerConfig
//!     → resolver.rs (SNI → best certificate, default unless sni_strict)
//! ```
//!
//! # Design Decisions
//! - Stores are replaced copy-on-write; in-flight handshakes keep the old map
//! - Certificate load failures skip the certificate, they never fail a reload
//! - Every store always has a default certificate (self-signed if not configured)

pub mod certificate;
pub mod manager;
pub mod options;
pub mod resolver;
pub mod store;

pub use certificate::CertificateEntry;
pub use manager::TlsManager;
pub use resolver::StoreResolver;
pub use store::CertificateStore;

use thiserror::Error;

/// Errors raised while loading certificates or building TLS configurations.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("unknown TLS options {0:?}")]
    UnknownOptions(String),

    #[error("unknown certificate store {0:?}")]
    UnknownStore(String),

    #[error("unsupported TLS version {0:?}")]
    UnsupportedVersion(String),

    #[error("TLS min version {min} is above max version {max}")]
    InvalidVersionRange { min: String, max: String },

    #[error("unknown cipher suite {0:?}")]
    UnknownCipherSuite(String),

    #[error("invalid certificate: {0}")]
    Certificate(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rustls: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("certificate generation: {0}")]
    Generate(#[from] rcgen::Error),
}
