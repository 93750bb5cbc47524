//! Certificate loading and identity extraction.

use std::net::IpAddr;
use std::sync::Arc;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use x509_parser::extensions::GeneralName;

use super::TlsError;

/// Names of the generated certificate served when nothing is configured.
pub const GENERATED_DEFAULT_NAMES: &[&str] = &["edge-router.default.invalid"];

/// A usable certificate chain plus the names it covers.
#[derive(Debug, Clone)]
pub struct CertificateEntry {
    certified_key: Arc<CertifiedKey>,
    sans: Vec<String>,
    domain_key: String,
}

impl CertificateEntry {
    /// Parse a PEM chain and PEM private key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        let chain = rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<Vec<_>, _>>()?;
        if chain.is_empty() {
            return Err(TlsError::Certificate("no certificate found in PEM".into()));
        }
        let key = rustls_pemfile::private_key(&mut &key_pem[..])?
            .ok_or_else(|| TlsError::Certificate("no private key found in PEM".into()))?;
        Self::from_der(chain, key)
    }

    /// Load from two settings that are each a file path or inline PEM.
    pub fn from_file_or_content(cert: &str, key: &str) -> Result<Self, TlsError> {
        Self::from_pem(&file_or_content(cert)?, &file_or_content(key)?)
    }

    pub fn from_der(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsError> {
        let leaf = chain
            .first()
            .ok_or_else(|| TlsError::Certificate("empty certificate chain".into()))?;
        let sans = certificate_names(leaf)?;
        if sans.is_empty() {
            return Err(TlsError::Certificate(
                "certificate has neither SANs nor a common name".into(),
            ));
        }

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
        Ok(Self {
            certified_key: Arc::new(CertifiedKey::new(chain, signing_key)),
            domain_key: sans.join(","),
            sans,
        })
    }

    /// Generate a self-signed certificate for `names`; the first one is also the CN.
    pub fn self_signed(names: &[&str]) -> Result<Self, TlsError> {
        let subject_alt_names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let mut params = CertificateParams::new(subject_alt_names)?;
        let mut subject = DistinguishedName::new();
        if let Some(first) = names.first() {
            subject.push(DnType::CommonName, *first);
        }
        params.distinguished_name = subject;

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        Self::from_der(vec![cert.der().clone()], key)
    }

    /// Certificate served by a store with no configured default.
    pub fn generated_default() -> Result<Self, TlsError> {
        Self::self_signed(GENERATED_DEFAULT_NAMES)
    }

    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.certified_key
    }

    /// Lowercased, sorted, deduplicated names (CN folded in).
    pub fn sans(&self) -> &[String] {
        &self.sans
    }

    /// Comma-joined [`Self::sans`]; the key in a store's dynamic map.
    pub fn domain_key(&self) -> &str {
        &self.domain_key
    }
}

/// Inline PEM is recognised by its armour; anything else is a path.
pub fn file_or_content(value: &str) -> Result<Vec<u8>, TlsError> {
    if value.contains("-----BEGIN") {
        Ok(value.as_bytes().to_vec())
    } else {
        Ok(std::fs::read(value.trim())?)
    }
}

/// Canonical domain key for a set of names.
pub fn domain_key<S: AsRef<str>>(names: &[S]) -> String {
    let mut names: Vec<String> = names
        .iter()
        .map(|n| n.as_ref().trim().to_ascii_lowercase())
        .collect();
    names.sort();
    names.dedup();
    names.join(",")
}

/// DNS and IP SANs of the leaf, plus the subject CN when it is not already one.
fn certificate_names(der: &CertificateDer<'_>) -> Result<Vec<String>, TlsError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
        .map_err(|e| TlsError::Certificate(e.to_string()))?;

    let mut names = Vec::new();
    if let Some(cn) = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
    {
        if !cn.is_empty() {
            names.push(cn.to_ascii_lowercase());
        }
    }

    let san = cert
        .subject_alternative_name()
        .map_err(|e| TlsError::Certificate(e.to_string()))?;
    if let Some(san) = san {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => names.push(dns.to_ascii_lowercase()),
                GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = ip_from_bytes(bytes) {
                        names.push(ip.to_string());
                    }
                }
                _ => {}
            }
        }
    }

    names.sort();
    names.dedup();
    Ok(names)
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_names_become_domain_key() {
        let entry = CertificateEntry::self_signed(&["www.Example.com", "example.com"]).unwrap();
        assert_eq!(entry.sans(), ["example.com", "www.example.com"]);
        assert_eq!(entry.domain_key(), "example.com,www.example.com");
    }

    #[test]
    fn ip_sans_are_rendered() {
        let entry = CertificateEntry::self_signed(&["127.0.0.1", "localhost"]).unwrap();
        assert!(entry.sans().iter().any(|s| s == "127.0.0.1"));
        assert!(entry.sans().iter().any(|s| s == "localhost"));
    }

    #[test]
    fn pem_round_trip_through_inline_content() {
        let generated = rcgen::generate_simple_self_signed(vec!["pem.test".to_string()]).unwrap();
        let cert_pem = generated.cert.pem();
        let key_pem = generated.key_pair.serialize_pem();

        let entry = CertificateEntry::from_file_or_content(&cert_pem, &key_pem).unwrap();
        assert!(entry.sans().iter().any(|s| s == "pem.test"));
    }

    #[test]
    fn missing_key_is_an_error() {
        let generated = rcgen::generate_simple_self_signed(vec!["pem.test".to_string()]).unwrap();
        let err = CertificateEntry::from_pem(generated.cert.pem().as_bytes(), b"").unwrap_err();
        assert!(matches!(err, TlsError::Certificate(_)));
    }

    #[test]
    fn domain_key_is_canonical() {
        assert_eq!(domain_key(&["B.com", "a.com", "b.com"]), "a.com,b.com");
    }
}
