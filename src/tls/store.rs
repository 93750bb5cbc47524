//! Certificate store: SNI → best certificate.
//!
//! # Responsibilities
//! - Hold the default certificate and the dynamic certificates of one store
//! - Pick the best certificate for a server name (exact or one-label wildcard)
//! - Cache matches for a fixed TTL, flushed whenever the map is replaced

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;

use super::certificate::{domain_key, CertificateEntry};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

struct CachedMatch {
    entry: Arc<CertificateEntry>,
    expires_at: Instant,
}

pub struct CertificateStore {
    default_certificate: ArcSwap<CertificateEntry>,
    dynamic_certificates: ArcSwap<HashMap<String, Arc<CertificateEntry>>>,
    cache: DashMap<String, CachedMatch>,
    cache_ttl: Duration,
}

impl CertificateStore {
    pub fn new(default_certificate: CertificateEntry) -> Self {
        Self {
            default_certificate: ArcSwap::from_pointee(default_certificate),
            dynamic_certificates: ArcSwap::from_pointee(HashMap::new()),
            cache: DashMap::new(),
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn default_certificate(&self) -> Arc<CertificateEntry> {
        self.default_certificate.load_full()
    }

    pub fn set_default_certificate(&self, entry: CertificateEntry) {
        self.default_certificate.store(Arc::new(entry));
    }

    pub fn dynamic_certificates(&self) -> Arc<HashMap<String, Arc<CertificateEntry>>> {
        self.dynamic_certificates.load_full()
    }

    /// Replace the whole dynamic map and drop every cached match.
    pub fn update_dynamic_certificates(&self, certificates: HashMap<String, Arc<CertificateEntry>>) {
        self.dynamic_certificates.store(Arc::new(certificates));
        self.reset_cache();
    }

    pub fn reset_cache(&self) {
        self.cache.clear();
    }

    /// Best dynamic certificate for `requested`.
    ///
    /// An empty name falls back to `local_host`. Among matching SANs the
    /// lexicographically last one wins. Matches are cached under the name
    /// after that substitution, so listeners sharing a store keep apart.
    pub fn get_best_certificate(
        &self,
        requested: &str,
        local_host: Option<&str>,
    ) -> Option<Arc<CertificateEntry>> {
        let mut name = requested.trim().to_ascii_lowercase();
        if name.is_empty() {
            if let Some(host) = local_host {
                name = host.trim().to_ascii_lowercase();
            }
        }
        if name.is_empty() {
            return None;
        }

        if let Some(hit) = self.cached(&name) {
            return Some(hit);
        }

        let certificates = self.dynamic_certificates.load();
        let mut matches: Vec<(&str, &Arc<CertificateEntry>)> = Vec::new();
        for (key, entry) in certificates.iter() {
            for san in key.split(',') {
                if matches_domain(&name, san) {
                    matches.push((san, entry));
                }
            }
        }
        matches.sort_by(|a, b| a.0.cmp(b.0));

        let (_, best) = matches.last()?;
        let best = Arc::clone(best);
        self.cache.insert(
            name.clone(),
            CachedMatch {
                entry: Arc::clone(&best),
                expires_at: Instant::now() + self.cache_ttl,
            },
        );
        Some(best)
    }

    /// A certificate covering every one of `domains`; partial coverage does not count.
    pub fn get_certificate<S: AsRef<str>>(&self, domains: &[S]) -> Option<Arc<CertificateEntry>> {
        if domains.is_empty() {
            return None;
        }

        let certificates = self.dynamic_certificates.load();
        if let Some(entry) = certificates.get(&domain_key(domains)) {
            return Some(Arc::clone(entry));
        }

        certificates
            .values()
            .find(|entry| {
                domains.iter().all(|domain| {
                    let domain = domain.as_ref().trim().to_ascii_lowercase();
                    entry.sans().iter().any(|san| matches_domain(&domain, san))
                })
            })
            .cloned()
    }

    fn cached(&self, requested: &str) -> Option<Arc<CertificateEntry>> {
        let now = Instant::now();
        let expired = match self.cache.get(requested) {
            Some(hit) if hit.expires_at > now => return Some(Arc::clone(&hit.entry)),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.cache.remove(requested);
        }
        None
    }
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("default", &self.default_certificate.load().domain_key())
            .field("dynamic", &self.dynamic_certificates.load().len())
            .field("cached", &self.cache.len())
            .finish()
    }
}

/// `san` covers `name` exactly, or as `*.` plus `name` minus its first label.
pub fn matches_domain(name: &str, san: &str) -> bool {
    if name == san {
        return true;
    }
    match (name.split_once('.'), san.strip_prefix("*.")) {
        (Some((label, parent)), Some(wildcard_parent)) => {
            !label.is_empty() && !parent.is_empty() && parent == wildcard_parent
        }
        _ => false,
    }
}
