//! Build version signal and the inbound message protocol.

use std::time::Duration;

use feedkit_common::with_timeout;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::ServiceWorkerError;

/// Messages the hosting page posts to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerMessage {
    /// `{"type": "SET_BUILD_VERSION", "version": "..."}`
    SetBuildVersion { version: String },
    /// Any other `type`; ignored.
    #[serde(other)]
    Unknown,
}

impl ControllerMessage {
    pub fn parse(data: &str) -> Result<Self, ServiceWorkerError> {
        serde_json::from_str(data).map_err(|e| ServiceWorkerError::InvalidMessage(e.to_string()))
    }
}

/// Single-writer, multi-reader build version.
///
/// Unset until the page sends it. Readers that need it during install or
/// activate call [`VersionSignal::ready_version`], which resolves as soon as a
/// value arrives or fails once the wait ceiling passes.
#[derive(Debug)]
pub struct VersionSignal {
    tx: watch::Sender<Option<String>>,
    wait_timeout: Duration,
}

impl VersionSignal {
    pub fn new(wait_timeout: Duration) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx, wait_timeout }
    }

    /// Record the version. Last write wins.
    pub fn set(&self, version: &str) -> Result<(), ServiceWorkerError> {
        let version = version.trim();
        if version.is_empty() {
            return Err(ServiceWorkerError::InvalidMessage(
                "build version must not be empty".to_string(),
            ));
        }

        let previous = self.tx.send_replace(Some(version.to_string()));
        match previous {
            Some(ref old) if old != version => {
                info!(old = %old, new = %version, "Build version replaced")
            }
            Some(_) => debug!(version, "Build version re-sent"),
            None => info!(version, "Build version set"),
        }
        Ok(())
    }

    /// The version if already known, without waiting.
    pub fn current(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Wait for the version, bounded by the configured ceiling.
    pub async fn ready_version(&self) -> Result<String, ServiceWorkerError> {
        let mut rx = self.tx.subscribe();
        let waited = with_timeout(self.wait_timeout, || async move {
            rx.wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|version| version.clone())
        })
        .await;

        match waited {
            Ok(Some(version)) => Ok(version),
            // The sender lives in `self`, so the channel cannot close while we wait.
            Ok(None) => Err(ServiceWorkerError::VersionUnset),
            Err(_) => Err(ServiceWorkerError::Timeout(self.wait_timeout)),
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }
}
