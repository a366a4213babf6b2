//! The cache controller: lifecycle handlers and fetch dispatch.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use feedkit_net::{Connectivity, Fetcher, NetError, Request, Response};
use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};
use url::Url;

use feedkit_common::{retry_with_backoff, RetryConfig};

use crate::cache::{CacheBackend, CacheEntry};
use crate::classify::{classify, Route};
use crate::config::{ControllerConfig, StoreNames};
use crate::container::Clients;
use crate::lifecycle::{ControllerId, LifecycleEvent, ServiceWorkerState};
use crate::offline::versioned_url;
use crate::version::{ControllerMessage, VersionSignal};
use crate::ServiceWorkerError;

/// Collaborators supplied by the host.
#[derive(Clone)]
pub struct ControllerEnv {
    pub fetcher: Arc<dyn Fetcher>,
    pub connectivity: Arc<dyn Connectivity>,
    pub caches: Arc<dyn CacheBackend>,
    pub clients: Arc<RwLock<Clients>>,
}

impl ControllerEnv {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        connectivity: Arc<dyn Connectivity>,
        caches: Arc<dyn CacheBackend>,
    ) -> Self {
        Self {
            fetcher,
            connectivity,
            caches,
            clients: Arc::new(RwLock::new(Clients::new())),
        }
    }
}

/// Result of handling one fetch event.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not intercepted; the browser's default network handling applies.
    PassThrough,
    /// Respond with this response.
    Respond(Response),
    /// No cache or offline fallback exists; the page sees the network error.
    NetworkError(NetError),
}

impl FetchOutcome {
    pub fn is_pass_through(&self) -> bool {
        matches!(self, FetchOutcome::PassThrough)
    }
}

impl From<Result<Response, NetError>> for FetchOutcome {
    fn from(result: Result<Response, NetError>) -> Self {
        match result {
            Ok(response) => FetchOutcome::Respond(response),
            Err(err) => FetchOutcome::NetworkError(err),
        }
    }
}

/// What install did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Version the stores were warmed for; `None` if it never arrived.
    pub version: Option<String>,
    /// Cache keys written.
    pub cached: Vec<String>,
    /// Critical paths that could not be cached.
    pub failed: Vec<String>,
}

/// What activate did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
    /// Version used to decide which stores are current; `None` skips the purge.
    pub version: Option<String>,
    /// Client ids now controlled by this controller.
    pub claimed: Vec<String>,
    /// Stale store names deleted.
    pub deleted: Vec<String>,
}

/// One controller instance.
pub struct CacheController {
    pub(crate) id: ControllerId,
    pub(crate) scope: Url,
    pub(crate) script: Option<(Url, String)>,
    pub(crate) config: Arc<ControllerConfig>,
    pub(crate) env: ControllerEnv,
    pub(crate) version: VersionSignal,
    state: RwLock<ServiceWorkerState>,
    skip_waiting: AtomicBool,
    pub(crate) revalidations: Arc<AtomicUsize>,
}

impl CacheController {
    pub fn new(scope: Url, config: impl Into<Arc<ControllerConfig>>, env: ControllerEnv) -> Self {
        let config = config.into();
        let version = VersionSignal::new(config.version_wait_timeout());
        Self {
            id: ControllerId::new(),
            scope,
            script: None,
            config,
            env,
            version,
            state: RwLock::new(ServiceWorkerState::Uninstalled),
            skip_waiting: AtomicBool::new(false),
            revalidations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Attach the script this controller was built from.
    pub fn with_script(mut self, script_url: Url, source: impl Into<String>) -> Self {
        self.script = Some((script_url, source.into()));
        self
    }

    pub fn id(&self) -> ControllerId {
        self.id
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn script_source(&self) -> Option<&str> {
        self.script.as_ref().map(|(_, source)| source.as_str())
    }

    pub async fn state(&self) -> ServiceWorkerState {
        *self.state.read().await
    }

    /// The build version if the page has sent it.
    pub fn build_version(&self) -> Option<String> {
        self.version.current()
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Background revalidations still in flight.
    pub fn pending_revalidations(&self) -> usize {
        self.revalidations.load(Ordering::SeqCst)
    }

    pub(crate) fn store_names(&self) -> Option<StoreNames> {
        self.version
            .current()
            .map(|version| self.config.store_names(&version))
    }

    async fn transition(
        &self,
        event: LifecycleEvent,
    ) -> Result<ServiceWorkerState, ServiceWorkerError> {
        let mut state = self.state.write().await;
        let from = *state;
        let next = from.transition(event)?;
        debug!(controller = %self.id, %from, to = %next, "Lifecycle transition");
        *state = next;
        Ok(next)
    }

    /// Retire this controller. No-op if it is already redundant.
    pub async fn mark_redundant(&self) {
        let mut state = self.state.write().await;
        let from = *state;
        if let Ok(next) = from.transition(LifecycleEvent::Superseded) {
            info!(controller = %self.id, %from, "Controller is redundant");
            *state = next;
        }
    }

    // ==================== Message ====================

    /// Handle a message posted by the page.
    pub async fn post_message(&self, data: &str) -> Result<(), ServiceWorkerError> {
        match ControllerMessage::parse(data)? {
            ControllerMessage::SetBuildVersion { version } => {
                self.set_build_version(&version).await
            }
            ControllerMessage::Unknown => {
                debug!(controller = %self.id, "Ignoring unknown message");
                Ok(())
            }
        }
    }

    /// Typed shortcut for `SET_BUILD_VERSION`.
    pub async fn set_build_version(&self, version: &str) -> Result<(), ServiceWorkerError> {
        self.version.set(version)?;
        // Activated before the version arrived: the stores were never opened.
        if self.state().await == ServiceWorkerState::Activated {
            if let Some(names) = self.store_names() {
                self.open_current_stores(&names).await;
            }
        }
        Ok(())
    }

    // ==================== Install ====================

    /// Install handler.
    ///
    /// Requests skip-waiting, then warms the static store once the build
    /// version is known. Resolves after every pre-warm fetch has settled.
    /// Without a version the install still succeeds, just cold.
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        self.transition(LifecycleEvent::InstallStarted).await?;
        self.skip_waiting.store(true, Ordering::SeqCst);

        let report = match self.version.ready_version().await {
            Ok(version) => self.prewarm(&version).await,
            Err(err) => {
                warn!(controller = %self.id, error = %err, "Installing without pre-warm");
                InstallReport::default()
            }
        };

        self.transition(LifecycleEvent::InstallFinished).await?;
        info!(
            controller = %self.id,
            version = ?report.version,
            cached = report.cached.len(),
            failed = report.failed.len(),
            "Controller installed"
        );
        Ok(report)
    }

    async fn prewarm(&self, version: &str) -> InstallReport {
        let names = self.config.store_names(version);
        let mut report = InstallReport {
            version: Some(version.to_string()),
            ..Default::default()
        };

        if let Err(err) = self.env.caches.open(&names.static_store).await {
            warn!(store = %names.static_store, error = %err, "Cannot open static store");
            report.failed = self.config.critical_assets.clone();
            return report;
        }

        let retry = self.config.prewarm_retry();
        let results = join_all(
            self.config
                .critical_assets
                .iter()
                .map(|path| self.prewarm_asset(&names, path, &retry)),
        )
        .await;

        for (path, result) in self.config.critical_assets.iter().zip(results) {
            match result {
                Some(key) => report.cached.push(key),
                None => report.failed.push(path.clone()),
            }
        }
        report
    }

    /// Fetch one critical asset as `path?v=<version>` and store it under that URL.
    async fn prewarm_asset(
        &self,
        names: &StoreNames,
        path: &str,
        retry: &RetryConfig,
    ) -> Option<String> {
        let url = match self.scope.join(path) {
            Ok(url) => versioned_url(&url, &names.version),
            Err(err) => {
                warn!(path, error = %err, "Invalid critical asset path");
                return None;
            }
        };
        let request = Request::get(url.clone());

        let fetched = retry_with_backoff(retry, || self.env.fetcher.fetch(request.clone())).await;
        let response = match fetched {
            Ok(response) => response,
            Err(err) => {
                warn!(url = %url, error = %err, "Pre-warm fetch failed");
                return None;
            }
        };

        if !response.ok() {
            warn!(url = %url, status = %response.status, "Pre-warm got non-OK response");
            return None;
        }

        let entry = CacheEntry::from_response(&url, &response);
        match self.env.caches.put(&names.static_store, entry).await {
            Ok(()) => {
                trace!(url = %url, store = %names.static_store, "Pre-warmed");
                Some(url.to_string())
            }
            Err(err) => {
                warn!(url = %url, error = %err, "Pre-warm cache write failed");
                None
            }
        }
    }

    // ==================== Activate ====================

    /// Activate handler.
    ///
    /// Claims clients, then deletes every store that is not current for the
    /// build version. Never deletes anything if the version is unknown.
    pub async fn activate(&self) -> Result<ActivateReport, ServiceWorkerError> {
        self.transition(LifecycleEvent::ActivateStarted).await?;

        let claimed = self.env.clients.write().await.claim(self.id, &self.scope);
        let mut report = ActivateReport {
            claimed,
            ..Default::default()
        };

        match self.version.ready_version().await {
            Ok(version) => {
                report.deleted = self.purge_stale(&version).await;
                self.open_current_stores(&self.config.store_names(&version)).await;
                report.version = Some(version);
            }
            Err(err) => {
                warn!(controller = %self.id, error = %err, "Skipping stale cache purge");
            }
        }

        self.transition(LifecycleEvent::ActivateFinished).await?;
        info!(
            controller = %self.id,
            version = ?report.version,
            claimed = report.claimed.len(),
            deleted = ?report.deleted,
            "Controller activated"
        );
        Ok(report)
    }

    /// Create this build's stores. Fetch handlers only write to stores that
    /// exist, so a store purged by a newer build stays deleted.
    async fn open_current_stores(&self, names: &StoreNames) {
        for store in [&names.static_store, &names.images_store] {
            if let Err(err) = self.env.caches.open(store).await {
                warn!(store = %store, error = %err, "Cannot open store");
            }
        }
    }

    async fn purge_stale(&self, version: &str) -> Vec<String> {
        let names = self.config.store_names(version);
        let existing = match self.env.caches.keys().await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "Cannot enumerate stores, nothing purged");
                return Vec::new();
            }
        };

        let stale: Vec<String> = existing
            .into_iter()
            .filter(|name| !names.is_current(name))
            .collect();

        let results = join_all(stale.iter().map(|name| self.env.caches.delete(name))).await;

        stale
            .into_iter()
            .zip(results)
            .filter_map(|(name, result)| match result {
                Ok(true) => {
                    debug!(store = %name, "Deleted stale store");
                    Some(name)
                }
                Ok(false) => None,
                Err(err) => {
                    warn!(store = %name, error = %err, "Failed to delete stale store");
                    None
                }
            })
            .collect()
    }

    // ==================== Fetch ====================

    /// Fetch handler.
    ///
    /// Only an activated controller intercepts. Never panics and never
    /// surfaces cache failures; a network error is returned only when no
    /// fallback exists.
    pub async fn handle_fetch(&self, request: Request) -> FetchOutcome {
        let state = self.state().await;
        if !state.can_intercept_fetch() {
            trace!(
                controller = %self.id,
                %state,
                url = %request.url,
                "Not active, passing through"
            );
            return FetchOutcome::PassThrough;
        }

        let route = classify(&self.config, &self.scope, &request);
        trace!(url = %request.url, ?route, "Classified request");

        match route {
            Route::PassThrough(_) => FetchOutcome::PassThrough,
            Route::Auth => FetchOutcome::Respond(self.network_with_offline_page(request).await),
            Route::CacheFirst => self.cache_first(request).await.into(),
            Route::StaleWhileRevalidate(kind) => {
                self.stale_while_revalidate(request, kind).await.into()
            }
        }
    }
}
