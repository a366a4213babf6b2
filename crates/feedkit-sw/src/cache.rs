//! Named request → response stores.
//!
//! [`CacheStorage`] is the in-memory implementation of [`CacheBackend`]. It can
//! be written to and restored from a JSON snapshot so stores outlive a
//! controller restart.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use feedkit_net::{Response, ResponseSource};
use futures::future::BoxFuture;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::ServiceWorkerError;

// ==================== Entries ====================

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL (the cache key).
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture a response under the given request URL.
    pub fn from_response(key: &Url, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: key.to_string(),
            method: "GET".to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild a response marked as served from cache.
    pub fn to_response(&self) -> Result<Response, ServiceWorkerError> {
        let url = Url::parse(&self.url)
            .map_err(|e| ServiceWorkerError::CacheError(format!("bad key {}: {}", self.url, e)))?;
        let status = StatusCode::from_u16(self.status).map_err(|e| {
            ServiceWorkerError::CacheError(format!("bad status {}: {}", self.status, e))
        })?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.insert(n, v);
            }
        }

        Ok(Response::new(url, status, headers, Bytes::from(self.body.clone()))
            .with_source(ResponseSource::Cache))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ==================== Cache ====================

/// A single named store.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request URL exactly (query included).
    pub fn match_request(&self, url: &str) -> Option<&CacheEntry> {
        self.entries.get(url)
    }

    /// Insert or replace an entry; last write wins.
    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.url.clone(), entry);
    }

    /// Delete entry.
    pub fn delete(&mut self, url: &str) -> bool {
        self.entries.remove(url).is_some()
    }

    /// All request URLs, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Backend ====================

/// Storage seam used by the controller.
///
/// Every method is a suspension point and may fail; the controller degrades
/// to offline responses when it does.
pub trait CacheBackend: Send + Sync {
    /// Names of all stores, sorted.
    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, ServiceWorkerError>>;

    /// Create the store if it does not exist.
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), ServiceWorkerError>>;

    /// Delete a whole store. Returns whether it existed.
    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, ServiceWorkerError>>;

    /// Look up a request URL in one store.
    fn match_in<'a>(
        &'a self,
        name: &'a str,
        url: &'a str,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>, ServiceWorkerError>>;

    /// Look up a request URL across every store.
    fn match_any<'a>(
        &'a self,
        url: &'a str,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>, ServiceWorkerError>>;

    /// Store an entry in an existing store. Fails if the store has been
    /// deleted or never opened; only [`CacheBackend::open`] creates stores.
    fn put<'a>(
        &'a self,
        name: &'a str,
        entry: CacheEntry,
    ) -> BoxFuture<'a, Result<(), ServiceWorkerError>>;

    /// Request URLs held by one store, sorted. Empty if the store is missing.
    fn entry_keys<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, ServiceWorkerError>>;
}

// ==================== Cache Storage ====================

#[derive(Debug, Default, Serialize, Deserialize)]
struct StorageSnapshot {
    caches: Vec<Cache>,
}

/// In-memory cache storage shared by every handler of a controller.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: RwLock<HashMap<String, Cache>>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a store exists.
    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }

    /// Restore storage from a snapshot file written by [`CacheStorage::save_snapshot`].
    pub async fn load_snapshot(path: &Path) -> Result<Self, ServiceWorkerError> {
        let data = tokio::fs::read(path).await?;
        let snapshot: StorageSnapshot = serde_json::from_slice(&data)?;
        let caches: HashMap<String, Cache> = snapshot
            .caches
            .into_iter()
            .map(|cache| (cache.name.clone(), cache))
            .collect();

        info!(path = %path.display(), stores = caches.len(), "Cache storage restored");

        Ok(Self {
            caches: RwLock::new(caches),
        })
    }

    /// Write every store to a JSON snapshot.
    pub async fn save_snapshot(&self, path: &Path) -> Result<(), ServiceWorkerError> {
        let snapshot = {
            let caches = self.caches.read().await;
            let mut stores: Vec<Cache> = caches.values().cloned().collect();
            stores.sort_by(|a, b| a.name.cmp(&b.name));
            StorageSnapshot { caches: stores }
        };

        let data = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, data).await?;

        debug!(path = %path.display(), stores = snapshot.caches.len(), "Cache storage saved");
        Ok(())
    }
}

impl CacheBackend for CacheStorage {
    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, ServiceWorkerError>> {
        Box::pin(async move {
            let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
            names.sort();
            Ok(names)
        })
    }

    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), ServiceWorkerError>> {
        Box::pin(async move {
            self.caches
                .write()
                .await
                .entry(name.to_string())
                .or_insert_with(|| Cache::new(name));
            Ok(())
        })
    }

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, ServiceWorkerError>> {
        Box::pin(async move { Ok(self.caches.write().await.remove(name).is_some()) })
    }

    fn match_in<'a>(
        &'a self,
        name: &'a str,
        url: &'a str,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>, ServiceWorkerError>> {
        Box::pin(async move {
            Ok(self
                .caches
                .read()
                .await
                .get(name)
                .and_then(|cache| cache.match_request(url))
                .cloned())
        })
    }

    fn match_any<'a>(
        &'a self,
        url: &'a str,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>, ServiceWorkerError>> {
        Box::pin(async move {
            let caches = self.caches.read().await;
            let mut names: Vec<&String> = caches.keys().collect();
            names.sort();
            Ok(names
                .into_iter()
                .filter_map(|name| caches.get(name))
                .find_map(|cache| cache.match_request(url))
                .cloned())
        })
    }

    fn put<'a>(
        &'a self,
        name: &'a str,
        entry: CacheEntry,
    ) -> BoxFuture<'a, Result<(), ServiceWorkerError>> {
        Box::pin(async move {
            let mut caches = self.caches.write().await;
            let cache = caches
                .get_mut(name)
                .ok_or_else(|| ServiceWorkerError::NotFound(format!("cache store '{}'", name)))?;
            cache.put(entry);
            Ok(())
        })
    }

    fn entry_keys<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, ServiceWorkerError>> {
        Box::pin(async move {
            Ok(self
                .caches
                .read()
                .await
                .get(name)
                .map(Cache::keys)
                .unwrap_or_default())
        })
    }
}
