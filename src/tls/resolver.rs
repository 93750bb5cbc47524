//! rustls certificate resolution backed by a [`CertificateStore`].

use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

use super::store::CertificateStore;

/// Picks the best certificate for the SNI, falling back to the store default
/// unless `sni_strict` is set.
#[derive(Debug)]
pub struct StoreResolver {
    store: Arc<CertificateStore>,
    sni_strict: bool,
    local_host: Option<String>,
}

impl StoreResolver {
    pub fn new(store: Arc<CertificateStore>, sni_strict: bool, local_host: Option<String>) -> Self {
        Self {
            store,
            sni_strict,
            local_host,
        }
    }
}

impl ResolvesServerCert for StoreResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let requested = client_hello.server_name().unwrap_or_default();
        if self.sni_strict && requested.is_empty() {
            tracing::debug!("Strict SNI: no server name provided");
            return None;
        }

        if let Some(entry) = self
            .store
            .get_best_certificate(requested, self.local_host.as_deref())
        {
            return Some(Arc::clone(entry.certified_key()));
        }

        if self.sni_strict {
            tracing::debug!(server_name = requested, "Strict SNI: no certificate matches");
            return None;
        }
        Some(Arc::clone(self.store.default_certificate().certified_key()))
    }
}
