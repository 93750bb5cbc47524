//! Named certificate stores and TLS options, swapped as a whole on reload.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::ServerConfig;

use super::certificate::CertificateEntry;
use super::options::build_server_config;
use super::resolver::StoreResolver;
use super::store::CertificateStore;
use super::TlsError;
use crate::config::schema::{TlsConfig, TlsOptionsConfig, DEFAULT_TLS_NAME};

pub struct TlsManager {
    stores: ArcSwap<HashMap<String, Arc<CertificateStore>>>,
    options: ArcSwap<BTreeMap<String, TlsOptionsConfig>>,
}

impl TlsManager {
    /// A manager with only the `default` store and options.
    pub fn new() -> Result<Self, TlsError> {
        let mut stores = HashMap::new();
        stores.insert(
            DEFAULT_TLS_NAME.to_string(),
            Arc::new(CertificateStore::new(CertificateEntry::generated_default()?)),
        );
        let mut options = BTreeMap::new();
        options.insert(DEFAULT_TLS_NAME.to_string(), TlsOptionsConfig::default());

        Ok(Self {
            stores: ArcSwap::from_pointee(stores),
            options: ArcSwap::from_pointee(options),
        })
    }

    /// Apply the `[tls]` section.
    ///
    /// Existing stores are reused so resolvers already handed out see the new
    /// certificates. Unreadable certificates are logged and skipped.
    pub fn update(&self, config: &TlsConfig) -> Result<(), TlsError> {
        let mut options = config.options.clone();
        options
            .entry(DEFAULT_TLS_NAME.to_string())
            .or_insert_with(TlsOptionsConfig::default);

        let current = self.stores.load();
        let mut stores: HashMap<String, Arc<CertificateStore>> = HashMap::new();
        let mut names: Vec<&str> = config.stores.keys().map(String::as_str).collect();
        if !config.stores.contains_key(DEFAULT_TLS_NAME) {
            names.push(DEFAULT_TLS_NAME);
        }

        for name in names {
            let store = match current.get(name) {
                Some(existing) => Arc::clone(existing),
                None => Arc::new(CertificateStore::new(CertificateEntry::generated_default()?)),
            };

            let configured = config
                .stores
                .get(name)
                .and_then(|s| s.default_certificate.as_ref());
            if let Some(default) = configured {
                match CertificateEntry::from_file_or_content(&default.cert_file, &default.key_file) {
                    Ok(entry) => store.set_default_certificate(entry),
                    Err(e) => tracing::warn!(
                        store = name,
                        error = %e,
                        "Unable to load default certificate, keeping the previous one"
                    ),
                }
            }

            stores.insert(name.to_string(), store);
        }

        let mut dynamic: HashMap<String, HashMap<String, Arc<CertificateEntry>>> = stores
            .keys()
            .map(|name| (name.clone(), HashMap::new()))
            .collect();

        for cert in &config.certificates {
            let entry = match CertificateEntry::from_file_or_content(&cert.cert_file, &cert.key_file) {
                Ok(entry) => Arc::new(entry),
                Err(e) => {
                    tracing::warn!(cert = %cert.cert_file, error = %e, "Skipping certificate");
                    continue;
                }
            };

            let targets: Vec<&str> = if cert.stores.is_empty() {
                vec![DEFAULT_TLS_NAME]
            } else {
                cert.stores.iter().map(String::as_str).collect()
            };
            for target in targets {
                let Some(certificates) = dynamic.get_mut(target) else {
                    tracing::warn!(store = target, "Certificate references an unknown store");
                    continue;
                };
                if certificates.contains_key(entry.domain_key()) {
                    tracing::debug!(
                        store = target,
                        domains = entry.domain_key(),
                        "Skipping duplicate certificate"
                    );
                    continue;
                }
                certificates.insert(entry.domain_key().to_string(), Arc::clone(&entry));
            }
        }

        for (name, certificates) in dynamic {
            if let Some(store) = stores.get(&name) {
                tracing::debug!(store = %name, certificates = certificates.len(), "Certificate store updated");
                store.update_dynamic_certificates(certificates);
            }
        }

        self.stores.store(Arc::new(stores));
        self.options.store(Arc::new(options));
        Ok(())
    }

    pub fn store(&self, name: &str) -> Option<Arc<CertificateStore>> {
        self.stores.load().get(name).cloned()
    }

    pub fn options(&self, name: &str) -> Option<TlsOptionsConfig> {
        self.options.load().get(name).cloned()
    }

    pub fn has_options(&self, name: &str) -> bool {
        self.options.load().contains_key(name)
    }

    /// Server configuration for `options` backed by `store`.
    pub fn get(&self, store: &str, options: &str) -> Result<Arc<ServerConfig>, TlsError> {
        self.get_bound(store, options, None)
    }

    /// As [`Self::get`], with the listener host used when a client sends no SNI.
    pub fn get_bound(
        &self,
        store: &str,
        options: &str,
        local_host: Option<&str>,
    ) -> Result<Arc<ServerConfig>, TlsError> {
        let opts = self
            .options(options)
            .ok_or_else(|| TlsError::UnknownOptions(options.to_string()))?;
        let store = self
            .store(store)
            .ok_or_else(|| TlsError::UnknownStore(store.to_string()))?;

        let resolver = Arc::new(StoreResolver::new(
            store,
            opts.sni_strict,
            local_host.map(str::to_string),
        ));
        Ok(Arc::new(build_server_config(&opts, resolver)?))
    }
}

impl std::fmt::Debug for TlsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stores = self.stores.load();
        let options = self.options.load();
        f.debug_struct("TlsManager")
            .field("stores", &stores.keys().collect::<Vec<_>>())
            .field("options", &options.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{CertificateConfig, StoreConfig};

    fn inline_certificate(names: &[&str]) -> CertificateConfig {
        let generated = rcgen::generate_simple_self_signed(
            names.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
        )
        .unwrap();
        CertificateConfig {
            cert_file: generated.cert.pem(),
            key_file: generated.key_pair.serialize_pem(),
            stores: Vec::new(),
        }
    }

    #[test]
    fn default_store_and_options_always_exist() {
        let manager = TlsManager::new().unwrap();
        assert!(manager.get("default", "default").is_ok());

        manager.update(&TlsConfig::default()).unwrap();
        assert!(manager.store("default").is_some());
        assert!(manager.has_options("default"));
    }

    #[test]
    fn unknown_names_are_errors() {
        let manager = TlsManager::new().unwrap();
        assert!(matches!(
            manager.get("default", "missing"),
            Err(TlsError::UnknownOptions(_))
        ));
        assert!(matches!(
            manager.get("missing", "default"),
            Err(TlsError::UnknownStore(_))
        ));
    }

    #[test]
    fn bad_options_fail_to_build() {
        let manager = TlsManager::new().unwrap();
        let mut config = TlsConfig::default();
        config.options.insert(
            "broken".into(),
            TlsOptionsConfig {
                cipher_suites: vec!["NOT_A_SUITE".into()],
                ..TlsOptionsConfig::default()
            },
        );
        manager.update(&config).unwrap();
        assert!(matches!(
            manager.get("default", "broken"),
            Err(TlsError::UnknownCipherSuite(_))
        ));
    }

    #[test]
    fn certificates_land_in_their_stores() {
        let manager = TlsManager::new().unwrap();
        let before = manager.store("default").unwrap();

        let mut config = TlsConfig::default();
        config.stores.insert("internal".into(), StoreConfig::default());
        config.certificates.push(inline_certificate(&["a.test"]));
        let mut internal = inline_certificate(&["b.test"]);
        internal.stores = vec!["internal".into(), "nowhere".into()];
        config.certificates.push(internal);
        config.certificates.push(CertificateConfig {
            cert_file: "/nonexistent/cert.pem".into(),
            key_file: "/nonexistent/key.pem".into(),
            stores: Vec::new(),
        });

        manager.update(&config).unwrap();

        let default = manager.store("default").unwrap();
        assert!(Arc::ptr_eq(&before, &default));
        assert!(default.get_best_certificate("a.test", None).is_some());
        assert!(default.get_best_certificate("b.test", None).is_none());

        let internal = manager.store("internal").unwrap();
        assert!(internal.get_best_certificate("b.test", None).is_some());
    }
}
