//! Response cache keyed by request signature, with HTTP freshness rules

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use moka::future::Cache as MokaCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::http::ApiResponse;

/// A stored response together with its validators and expiry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Resource path the response belongs to, without the query
    pub path: String,
    pub body: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn has_validators(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

/// What the `Cache-Control` header allows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    NoStore,
    MaxAge(i64),
    Unspecified,
}

pub fn parse_cache_control(value: Option<&str>) -> Freshness {
    let Some(value) = value else {
        return Freshness::Unspecified;
    };
    let mut freshness = Freshness::Unspecified;
    for directive in value.split(',').map(|d| d.trim().to_ascii_lowercase()) {
        if directive == "no-store" {
            return Freshness::NoStore;
        }
        if directive == "no-cache" {
            freshness = Freshness::MaxAge(0);
        } else if let Some(age) = directive.strip_prefix("max-age=") {
            if let Ok(age) = age.trim_matches('"').parse::<i64>() {
                if freshness == Freshness::Unspecified {
                    freshness = Freshness::MaxAge(age.max(0));
                }
            }
        }
    }
    freshness
}

/// Two resource paths overlap when one is a path-prefix of the other.
fn paths_overlap(a: &str, b: &str) -> bool {
    fn is_prefix(prefix: &str, path: &str) -> bool {
        path == prefix
            || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
    }
    is_prefix(a, b) || is_prefix(b, a)
}

/// Response cache shared by every task, bounded to `max_entries` responses.
///
/// Expired entries that carry validators are kept so they can be revalidated
/// with a conditional request; moka evicts the least useful ones once the
/// bound is reached.
#[derive(Clone)]
pub struct ResponseCache {
    entries: MokaCache<String, CacheEntry>,
    default_ttl: Duration,
    persist: Arc<Mutex<()>>,
}

impl ResponseCache {
    pub fn new(default_ttl: Duration, max_entries: u64) -> Self {
        Self {
            entries: MokaCache::builder()
                .max_capacity(max_entries)
                .support_invalidation_closures()
                .build(),
            default_ttl,
            persist: Arc::new(Mutex::new(())),
        }
    }

    pub async fn get(&self, signature: &str) -> Option<CacheEntry> {
        self.entries.get(signature).await
    }

    fn expiry(&self, freshness: Freshness, now: DateTime<Utc>) -> DateTime<Utc> {
        match freshness {
            Freshness::MaxAge(age) => now + Duration::seconds(age),
            _ => now + self.default_ttl,
        }
    }

    /// Store a `200` response if its headers allow reuse. Returns whether it
    /// was stored.
    pub async fn store(&self, signature: &str, path: &str, response: &ApiResponse, now: DateTime<Utc>) -> bool {
        let freshness = parse_cache_control(response.header("cache-control"));
        if response.status != 200 || freshness == Freshness::NoStore {
            self.entries.invalidate(signature).await;
            return false;
        }

        let entry = CacheEntry {
            path: path.to_string(),
            body: response.body.clone(),
            etag: response.header("etag").map(str::to_string),
            last_modified: response.header("last-modified").map(str::to_string),
            expires_at: self.expiry(freshness, now),
        };
        if !entry.is_fresh(now) && !entry.has_validators() {
            self.entries.invalidate(signature).await;
            return false;
        }

        self.entries.insert(signature.to_string(), entry).await;
        true
    }

    /// A `304` confirmed the entry; extend its lifetime. `None` if the entry
    /// is gone, e.g. invalidated while the request was in flight.
    pub async fn revalidate(&self, signature: &str, response: &ApiResponse, now: DateTime<Utc>) -> Option<CacheEntry> {
        let mut entry = self.entries.get(signature).await?;
        entry.expires_at = self.expiry(parse_cache_control(response.header("cache-control")), now);
        if let Some(etag) = response.header("etag") {
            entry.etag = Some(etag.to_string());
        }
        self.entries.insert(signature.to_string(), entry.clone()).await;
        Some(entry)
    }

    /// Drop every entry whose resource overlaps `path`.
    pub fn invalidate(&self, path: &str) {
        let path = path.to_string();
        self.invalidate_where(move |entry| paths_overlap(&entry.path, &path));
    }

    /// Drop expired entries that cannot be revalidated.
    pub fn prune(&self, now: DateTime<Utc>) {
        self.invalidate_where(move |entry| !entry.is_fresh(now) && !entry.has_validators());
    }

    fn invalidate_where(&self, predicate: impl Fn(&CacheEntry) -> bool + Send + Sync + 'static) {
        if let Err(e) = self.entries.invalidate_entries_if(move |_, entry| predicate(entry)) {
            tracing::warn!(error = %e, "Cache rejected an invalidation predicate, dropping every entry");
            self.entries.invalidate_all();
        }
    }

    pub async fn load_from_disk(&self, path: &Path) -> Result<()> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(());
        }
        let content = tokio::fs::read_to_string(path).await?;
        let loaded: HashMap<String, CacheEntry> = serde_json::from_str(&content)?;
        let count = loaded.len();
        for (signature, entry) in loaded {
            self.entries.insert(signature, entry).await;
        }
        tracing::debug!(entries = count, "Response cache loaded from disk");
        Ok(())
    }

    /// Tasks share one file, so saves are serialized and replace it by rename.
    pub async fn save_to_disk(&self, path: &Path) -> Result<()> {
        let _guard = self.persist.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Lookups apply pending invalidations, iteration may not.
        let signatures: Vec<Arc<String>> = self.entries.iter().map(|(signature, _)| signature).collect();
        let mut live = HashMap::with_capacity(signatures.len());
        for signature in signatures {
            if let Some(entry) = self.entries.get(signature.as_str()).await {
                live.insert(signature.to_string(), entry);
            }
        }

        let temp = path.with_extension("json.tmp");
        tokio::fs::write(&temp, serde_json::to_string(&live)?).await?;
        tokio::fs::rename(&temp, path).await?;
        tracing::debug!(entries = live.len(), "Response cache saved to disk");
        Ok(())
    }
}
