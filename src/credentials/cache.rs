//! Per-`registryDomain` in-memory credential cache with a configurable
//! TTL, active only when `--enable-cache` is set.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::CredentialCandidate;

struct Entry {
    candidates: Vec<CredentialCandidate>,
    expires_at: Instant,
}

#[derive(Default)]
pub struct CredentialCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, registry_domain: &str) -> Option<Vec<CredentialCandidate>> {
        let entries = self.entries.read().await;
        let entry = entries.get(registry_domain)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some(entry.candidates.clone())
    }

    pub async fn put(
        &self,
        registry_domain: String,
        candidates: Vec<CredentialCandidate>,
        ttl: Duration,
    ) {
        let mut entries = self.entries.write().await;
        entries.insert(registry_domain, Entry { candidates, expires_at: Instant::now() + ttl });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_returns_candidates() {
        let cache = CredentialCache::new();
        cache.put("registry.example.com".into(), vec![CredentialCandidate::default()], Duration::from_secs(60)).await;
        let got = cache.get("registry.example.com").await;
        assert_eq!(got.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_not_returned() {
        let cache = CredentialCache::new();
        cache
            .put("registry.example.com".into(), vec![CredentialCandidate::default()], Duration::from_millis(0))
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.get("registry.example.com").await.is_none());
    }

    #[tokio::test]
    async fn miss_on_unknown_domain() {
        let cache = CredentialCache::new();
        assert!(cache.get("unknown.example.com").await.is_none());
    }
}
