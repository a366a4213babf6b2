//! # FeedKit Service Worker
//!
//! Offline cache controller for the FeedKit web app.
//!
//! ## Features
//!
//! - **Lifecycle**: install (pre-warm critical assets), activate (purge stale
//!   stores), message (`SET_BUILD_VERSION`)
//! - **Routing**: every intercepted request is classified into a caching
//!   strategy or passed through to the network
//! - **Strategies**: cache-first, stale-while-revalidate, offline-aware auth
//! - **Offline fallback**: contextual offline page, then an inline 503 page
//! - **Registration**: scope-based container that swaps controllers on update
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (host side)
//!     │
//!     └── ServiceWorkerRegistration (per scope)
//!             ├── installing (CacheController)
//!             └── active (CacheController)
//!                     ├── VersionSignal        build version, bounded wait
//!                     ├── classify()           Request → Route
//!                     ├── strategies           cache-first / SWR / auth
//!                     └── CacheBackend         static-<v>, images-<v>
//! ```

use std::time::Duration;

use feedkit_common::FeedKitError;
use thiserror::Error;

pub mod cache;
pub mod classify;
pub mod config;
pub mod container;
pub mod controller;
pub mod lifecycle;
pub mod offline;
mod strategy;
pub mod version;

pub use cache::{Cache, CacheBackend, CacheEntry, CacheStorage};
pub use classify::{classify, PassReason, Route, StoreKind};
pub use config::{ControllerConfig, StoreNames};
pub use container::{
    Client, Clients, RegisterOutcome, RegistrationOptions, ServiceWorkerContainer,
    ServiceWorkerEvent, ServiceWorkerRegistration,
};
pub use controller::{
    ActivateReport, CacheController, ControllerEnv, FetchOutcome, InstallReport,
};
pub use lifecycle::{ControllerId, LifecycleEvent, ServiceWorkerState};
pub use version::{ControllerMessage, VersionSignal};

// ==================== Errors ====================

/// Errors that can occur in cache controller operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Build version not received within {0:?}")]
    Timeout(Duration),

    #[error("Build version has not been set")]
    VersionUnset,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

impl From<ServiceWorkerError> for FeedKitError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::Timeout(d) => FeedKitError::Timeout(d),
            ServiceWorkerError::Io(e) => FeedKitError::Io(e),
            ServiceWorkerError::NotFound(what) => FeedKitError::NotFound(what),
            err @ (ServiceWorkerError::CacheError(_) | ServiceWorkerError::Snapshot(_)) => {
                FeedKitError::cache_with_source("cache storage failed", err)
            }
            err @ ServiceWorkerError::Config(_) => {
                FeedKitError::config_with_source("invalid controller config", err)
            }
            err => FeedKitError::lifecycle_with_source("controller failed", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion_categories() {
        let timeout: FeedKitError = ServiceWorkerError::Timeout(Duration::from_secs(5)).into();
        assert_eq!(timeout.category(), "timeout");

        let cache: FeedKitError = ServiceWorkerError::CacheError("closed".into()).into();
        assert_eq!(cache.category(), "cache");

        let state: FeedKitError = ServiceWorkerError::StateError("bad".into()).into();
        assert_eq!(state.category(), "lifecycle");
    }
}
