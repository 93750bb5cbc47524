//! TLS options → rustls `ServerConfig`.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::server::ResolvesServerCert;
use rustls::{ServerConfig, SupportedCipherSuite, SupportedProtocolVersion};

use super::TlsError;
use crate::config::schema::TlsOptionsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Version {
    Tls12,
    Tls13,
}

fn parse_version(value: &str) -> Result<Version, TlsError> {
    match value.trim() {
        "VersionTLS12" | "1.2" | "tls12" => Ok(Version::Tls12),
        "VersionTLS13" | "1.3" | "tls13" => Ok(Version::Tls13),
        other => Err(TlsError::UnsupportedVersion(other.to_string())),
    }
}

/// Protocol versions between `min` and `max` inclusive. Empty bounds are open.
pub fn protocol_versions(
    min: &str,
    max: &str,
) -> Result<Vec<&'static SupportedProtocolVersion>, TlsError> {
    let low = if min.trim().is_empty() {
        Version::Tls12
    } else {
        parse_version(min)?
    };
    let high = if max.trim().is_empty() {
        Version::Tls13
    } else {
        parse_version(max)?
    };
    if low > high {
        return Err(TlsError::InvalidVersionRange {
            min: min.to_string(),
            max: max.to_string(),
        });
    }

    let mut versions = Vec::with_capacity(2);
    if low == Version::Tls12 {
        versions.push(&rustls::version::TLS12);
    }
    if high == Version::Tls13 {
        versions.push(&rustls::version::TLS13);
    }
    Ok(versions)
}

/// IANA name of a suite; rustls spells TLS 1.3 suites `TLS13_*`.
fn iana_name(suite: &SupportedCipherSuite) -> String {
    let debug = format!("{:?}", suite.suite());
    match debug.strip_prefix("TLS13_") {
        Some(rest) => format!("TLS_{rest}"),
        None => debug,
    }
}

/// The ring provider, with TLS 1.2 suites restricted to `allowed` when non-empty.
///
/// TLS 1.3 suites are not configurable and always stay enabled.
pub fn crypto_provider(allowed: &[String]) -> Result<CryptoProvider, TlsError> {
    let mut provider = rustls::crypto::ring::default_provider();
    if allowed.is_empty() {
        return Ok(provider);
    }

    for name in allowed {
        let known = provider
            .cipher_suites
            .iter()
            .any(|suite| iana_name(suite) == name.trim());
        if !known {
            return Err(TlsError::UnknownCipherSuite(name.clone()));
        }
    }

    provider.cipher_suites.retain(|suite| match suite {
        SupportedCipherSuite::Tls13(_) => true,
        SupportedCipherSuite::Tls12(_) => {
            let name = iana_name(suite);
            allowed.iter().any(|a| a.trim() == name)
        }
    });
    Ok(provider)
}

/// Build a server configuration for one options name.
pub fn build_server_config(
    options: &TlsOptionsConfig,
    resolver: Arc<dyn ResolvesServerCert>,
) -> Result<ServerConfig, TlsError> {
    let versions = protocol_versions(&options.min_version, &options.max_version)?;
    let provider = crypto_provider(&options.cipher_suites)?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&versions)?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = options
        .alpn_protocols
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();

    Ok(config)
}
