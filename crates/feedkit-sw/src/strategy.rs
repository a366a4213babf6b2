//! Caching strategies and offline page resolution.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use feedkit_net::{NetError, Request, Response};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::cache::CacheEntry;
use crate::classify::StoreKind;
use crate::config::StoreNames;
use crate::controller::CacheController;
use crate::offline::{
    inline_offline_response, is_versioned_copy, offline_url, service_unavailable,
    tagged_offline_url, versioned_url,
};
use crate::ServiceWorkerError;

/// Document-level request: navigation, HTML-accepting, or the root/index page.
fn is_document(request: &Request) -> bool {
    let path = request.url.path();
    request.is_navigation() || request.accepts_html() || path == "/" || path == "/index.html"
}

impl CacheController {
    // ==================== Lookups ====================

    /// Exact URL first, then the `?v=<version>` form written by install.
    async fn lookup(
        &self,
        store: &str,
        url: &Url,
        version: &str,
    ) -> Result<Option<Response>, ServiceWorkerError> {
        if let Some(entry) = self.env.caches.match_in(store, url.as_str()).await? {
            return entry.to_response().map(Some);
        }

        let versioned = versioned_url(url, version);
        if versioned != *url {
            if let Some(entry) = self.env.caches.match_in(store, versioned.as_str()).await? {
                return entry.to_response().map(Some);
            }
        }
        Ok(None)
    }

    /// Write a copy of an OK response. Failures are logged, never returned.
    async fn store(&self, store: &str, request: &Request, response: &Response) {
        let entry = CacheEntry::from_response(&request.url, response);
        match self.env.caches.put(store, entry).await {
            Ok(()) => trace!(url = %request.url, store, "Stored response"),
            Err(err) => warn!(url = %request.url, store, error = %err, "Cache write failed"),
        }
    }

    /// Offline page tagged with `from`, then untagged, in the static store.
    async fn resolve_offline_page(
        &self,
        names: &StoreNames,
        from: &str,
    ) -> Result<Option<Response>, ServiceWorkerError> {
        let page = &self.config.offline_page;

        if let Some(tagged) = tagged_offline_url(&self.scope, page, from) {
            if let Some(found) = self.lookup(&names.static_store, &tagged, &names.version).await? {
                return Ok(Some(found));
            }
        }

        match offline_url(&self.scope, page) {
            Some(plain) => self.lookup(&names.static_store, &plain, &names.version).await,
            None => Ok(None),
        }
    }

    /// Offline page from any store, for when the current stores are unusable.
    async fn match_offline_anywhere(&self) -> Result<Option<Response>, ServiceWorkerError> {
        let Some(plain) = offline_url(&self.scope, &self.config.offline_page) else {
            return Ok(None);
        };

        if let Some(entry) = self.env.caches.match_any(plain.as_str()).await? {
            return entry.to_response().map(Some);
        }

        if let Some(version) = self.version.current() {
            let versioned = versioned_url(&plain, &version);
            if let Some(entry) = self.env.caches.match_any(versioned.as_str()).await? {
                return entry.to_response().map(Some);
            }
        }

        // Pre-warmed copies from any build; the most recently cached wins.
        let prefix = format!("{}-", self.config.static_cache_prefix);
        let mut newest: Option<CacheEntry> = None;
        for store in self.env.caches.keys().await? {
            if !store.starts_with(&prefix) {
                continue;
            }
            for key in self.env.caches.entry_keys(&store).await? {
                if !is_versioned_copy(&plain, &key) {
                    continue;
                }
                if let Some(entry) = self.env.caches.match_in(&store, &key).await? {
                    if newest.as_ref().map_or(true, |n| entry.cached_at > n.cached_at) {
                        newest = Some(entry);
                    }
                }
            }
        }
        newest.map(|entry| entry.to_response()).transpose()
    }

    /// Offline page for `request`, ending in the inline 503 document.
    pub(crate) async fn offline_fallback(&self, request: &Request) -> Response {
        let from = request.url.path();
        let resolved = match self.store_names() {
            Some(names) => self.resolve_offline_page(&names, from).await,
            None => self.match_offline_anywhere().await,
        };

        match resolved {
            Ok(Some(page)) => page,
            Ok(None) => {
                debug!(url = %request.url, "No cached offline page, serving inline");
                inline_offline_response(&request.url)
            }
            Err(err) => {
                warn!(url = %request.url, error = %err, "Offline page lookup failed");
                inline_offline_response(&request.url)
            }
        }
    }

    /// Last resort after a cache failure: offline page or inline 503 for HTML,
    /// plain 503 otherwise.
    async fn degraded_response(&self, request: &Request) -> Response {
        if !request.accepts_html() {
            return service_unavailable(&request.url);
        }
        match self.match_offline_anywhere().await {
            Ok(Some(page)) => page,
            _ => inline_offline_response(&request.url),
        }
    }

    // ==================== Cache-first ====================

    /// Serve critical assets from the static store, filling it from the network.
    pub(crate) async fn cache_first(&self, request: Request) -> Result<Response, NetError> {
        let Some(names) = self.store_names() else {
            debug!(url = %request.url, "Build version unknown, fetching without caching");
            return match self.env.fetcher.fetch(request.clone()).await {
                Err(_) if is_document(&request) => Ok(self.offline_fallback(&request).await),
                result => result,
            };
        };

        match self.try_cache_first(&names, &request).await {
            Ok(result) => result,
            Err(err) => {
                warn!(url = %request.url, error = %err, "Cache-first failed, degrading");
                Ok(self.degraded_response(&request).await)
            }
        }
    }

    async fn try_cache_first(
        &self,
        names: &StoreNames,
        request: &Request,
    ) -> Result<Result<Response, NetError>, ServiceWorkerError> {
        let store = names.static_store.as_str();

        if let Some(hit) = self.lookup(store, &request.url, &names.version).await? {
            trace!(url = %request.url, "Cache-first hit");
            return Ok(Ok(hit));
        }

        let net_err = match self.env.fetcher.fetch(request.clone()).await {
            Ok(response) => {
                if response.ok() {
                    self.store(store, request, &response).await;
                }
                return Ok(Ok(response));
            }
            Err(err) => err,
        };

        // A concurrent fetch may have filled the store meanwhile.
        if let Some(hit) = self.lookup(store, &request.url, &names.version).await? {
            debug!(url = %request.url, "Network failed, found late cache entry");
            return Ok(Ok(hit));
        }

        if is_document(request) {
            if let Some(page) = self.resolve_offline_page(names, request.url.path()).await? {
                info!(url = %request.url, error = %net_err, "Serving offline page");
                return Ok(Ok(page));
            }
        }

        debug!(url = %request.url, error = %net_err, "No cached fallback");
        Ok(Err(net_err))
    }

    // ==================== Stale-while-revalidate ====================

    /// Serve the cached copy immediately and refresh it in the background.
    pub(crate) async fn stale_while_revalidate(
        &self,
        request: Request,
        kind: StoreKind,
    ) -> Result<Response, NetError> {
        let Some(names) = self.store_names() else {
            debug!(url = %request.url, "Build version unknown, fetching without caching");
            return self.env.fetcher.fetch(request).await;
        };
        let store = names.for_kind(kind).to_string();

        let cached = match self.lookup(&store, &request.url, &names.version).await {
            Ok(cached) => cached,
            Err(err) => {
                warn!(url = %request.url, error = %err, "Stale-while-revalidate setup failed");
                return self.swr_fallback(request).await;
            }
        };

        match cached {
            Some(stale) => {
                self.spawn_revalidation(store, request);
                Ok(stale)
            }
            None => {
                let response = self.env.fetcher.fetch(request.clone()).await?;
                if response.ok() {
                    self.store(&store, &request, &response).await;
                }
                Ok(response)
            }
        }
    }

    fn spawn_revalidation(&self, store: String, request: Request) {
        let fetcher = Arc::clone(&self.env.fetcher);
        let caches = Arc::clone(&self.env.caches);
        let pending = Arc::clone(&self.revalidations);
        pending.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            match fetcher.fetch(request.clone()).await {
                Ok(response) if response.ok() => {
                    let entry = CacheEntry::from_response(&request.url, &response);
                    if let Err(err) = caches.put(&store, entry).await {
                        warn!(url = %request.url, error = %err, "Revalidation write failed");
                    } else {
                        trace!(url = %request.url, store = %store, "Revalidated");
                    }
                }
                Ok(response) => {
                    debug!(
                        url = %request.url,
                        status = %response.status,
                        "Revalidation not stored"
                    );
                }
                Err(err) => {
                    debug!(
                        url = %request.url,
                        error = %err,
                        "Revalidation failed, stale copy kept"
                    );
                }
            }
            pending.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// After a cache failure: cached offline page for HTML, otherwise the network.
    async fn swr_fallback(&self, request: Request) -> Result<Response, NetError> {
        if request.accepts_html() {
            if let Ok(Some(page)) = self.match_offline_anywhere().await {
                return Ok(page);
            }
        }
        self.env.fetcher.fetch(request).await
    }

    // ==================== Auth ====================

    /// Network for root and auth routes, with the offline page instead of a failure.
    pub(crate) async fn network_with_offline_page(&self, request: Request) -> Response {
        if self.env.connectivity.is_online() == Some(false) {
            info!(url = %request.url, "Offline, serving offline page");
            return self.offline_fallback(&request).await;
        }

        match self.env.fetcher.fetch(request.clone()).await {
            Ok(response) => response,
            Err(err) => {
                warn!(url = %request.url, error = %err, "Auth route fetch failed");
                self.offline_fallback(&request).await
            }
        }
    }
}
