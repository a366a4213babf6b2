//! Controller configuration: asset manifest, allowlists and store naming.

use std::path::Path;
use std::time::Duration;

use feedkit_common::RetryConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::classify::StoreKind;
use crate::ServiceWorkerError;

/// Injected configuration for a [`crate::CacheController`].
///
/// Every field has a default matching the production web app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Paths pre-warmed on install and served cache-first.
    pub critical_assets: Vec<String>,

    /// Extensions (without the dot) eligible for stale-while-revalidate.
    pub cacheable_extensions: Vec<String>,

    /// Extensions routed to the images store.
    pub image_extensions: Vec<String>,

    /// Cross-origin hosts whose assets may be cached.
    pub cacheable_hosts: Vec<String>,

    /// Backend API prefix; never cached.
    pub api_prefix: String,

    /// Pages handled by the offline-aware auth strategy (besides `/`).
    pub auth_paths: Vec<String>,

    /// Auth API prefix, handled by the auth strategy before `api_prefix` applies.
    pub auth_api_prefix: String,

    /// Offline fallback document.
    pub offline_page: String,

    pub static_cache_prefix: String,
    pub images_cache_prefix: String,

    /// Ceiling for the build-version wait in install and activate.
    pub version_wait_timeout_ms: u64,

    /// Attempts per critical asset during pre-warm.
    pub prewarm_attempts: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            critical_assets: to_strings(&[
                "/",
                "/globals.css",
                "/favicon.ico",
                "/icons/icon-192.png",
                "/icons/icon-512.png",
                "/manifest.json",
                "/offline.html",
            ]),
            cacheable_extensions: to_strings(&[
                "css", "js", "png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico", "woff",
                "woff2", "ttf",
            ]),
            image_extensions: to_strings(&[
                "png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico",
            ]),
            cacheable_hosts: Vec::new(),
            api_prefix: "/api/".to_string(),
            auth_paths: to_strings(&["/home", "/auth"]),
            auth_api_prefix: "/api/auth".to_string(),
            offline_page: "/offline.html".to_string(),
            static_cache_prefix: "static".to_string(),
            images_cache_prefix: "images".to_string(),
            version_wait_timeout_ms: 5000,
            prewarm_attempts: 1,
        }
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl ControllerConfig {
    /// Parse and validate a JSON config. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ServiceWorkerError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ServiceWorkerError::Config(format!("invalid JSON: {}", e)))?;
        config.validated()
    }

    /// Read a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, ServiceWorkerError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check invariants and normalize extensions and hosts to lowercase.
    pub fn validated(mut self) -> Result<Self, ServiceWorkerError> {
        for path in self
            .critical_assets
            .iter()
            .chain(self.auth_paths.iter())
            .chain([&self.offline_page, &self.api_prefix, &self.auth_api_prefix])
        {
            if !path.starts_with('/') {
                return Err(ServiceWorkerError::Config(format!(
                    "path '{}' must start with '/'",
                    path
                )));
            }
        }

        if self.version_wait_timeout_ms == 0 {
            return Err(ServiceWorkerError::Config(
                "version_wait_timeout_ms must be positive".to_string(),
            ));
        }

        if self.static_cache_prefix.is_empty()
            || self.images_cache_prefix.is_empty()
            || self.static_cache_prefix == self.images_cache_prefix
        {
            return Err(ServiceWorkerError::Config(
                "cache prefixes must be non-empty and distinct".to_string(),
            ));
        }

        if !self.critical_assets.contains(&self.offline_page) {
            warn!(
                offline_page = %self.offline_page,
                "Offline page is not a critical asset; it will not be pre-warmed"
            );
        }

        let normalize = |items: &mut Vec<String>| {
            for item in items.iter_mut() {
                *item = item.trim_start_matches('.').to_ascii_lowercase();
            }
        };
        normalize(&mut self.cacheable_extensions);
        normalize(&mut self.image_extensions);
        normalize(&mut self.cacheable_hosts);

        Ok(self)
    }

    pub fn version_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.version_wait_timeout_ms)
    }

    pub fn prewarm_retry(&self) -> RetryConfig {
        RetryConfig::attempts(self.prewarm_attempts)
    }

    /// Current store names for a build version.
    pub fn store_names(&self, version: &str) -> StoreNames {
        StoreNames {
            version: version.to_string(),
            static_store: format!("{}-{}", self.static_cache_prefix, version),
            images_store: format!("{}-{}", self.images_cache_prefix, version),
        }
    }

    pub fn is_image_extension(&self, ext: &str) -> bool {
        self.image_extensions.iter().any(|e| e == ext)
    }

    pub fn is_cacheable_extension(&self, ext: &str) -> bool {
        self.cacheable_extensions.iter().any(|e| e == ext)
    }

    pub fn is_cacheable_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.cacheable_hosts.iter().any(|h| *h == host)
    }
}

/// The two version-current store names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreNames {
    pub version: String,
    pub static_store: String,
    pub images_store: String,
}

impl StoreNames {
    pub fn for_kind(&self, kind: StoreKind) -> &str {
        match kind {
            StoreKind::Static => &self.static_store,
            StoreKind::Images => &self.images_store,
        }
    }

    /// Whether a store survives activation.
    pub fn is_current(&self, name: &str) -> bool {
        name == self.static_store || name == self.images_store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ControllerConfig::default().validated().unwrap();
        assert!(config.critical_assets.contains(&config.offline_page));
        assert_eq!(config.version_wait_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_store_names() {
        let names = ControllerConfig::default().store_names("abc123");
        assert_eq!(names.static_store, "static-abc123");
        assert_eq!(names.images_store, "images-abc123");
        assert!(names.is_current("images-abc123"));
        assert!(!names.is_current("static-old"));
        assert_eq!(names.for_kind(StoreKind::Images), "images-abc123");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ControllerConfig::from_json_str(
            r#"{"cacheable_hosts": ["Images.Example.COM"], "cacheable_extensions": [".PNG"]}"#,
        )
        .unwrap();

        assert_eq!(config.api_prefix, "/api/");
        assert!(config.is_cacheable_host("images.example.com"));
        assert!(config.is_cacheable_extension("png"));
        assert!(!config.is_cacheable_extension("css"));
    }

    #[test]
    fn test_relative_path_rejected() {
        let err = ControllerConfig::from_json_str(r#"{"offline_page": "offline.html"}"#)
            .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::Config(_)));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = ControllerConfig::from_json_str(r#"{"version_wait_timeout_ms": 0}"#)
            .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.json");
        std::fs::write(&path, r#"{"prewarm_attempts": 3}"#).unwrap();

        let config = ControllerConfig::from_file(&path).unwrap();
        assert_eq!(config.prewarm_retry().max_attempts, 3);
    }
}
