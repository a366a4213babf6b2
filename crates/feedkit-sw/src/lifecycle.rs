//! Controller lifecycle states and transitions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::ServiceWorkerError;

/// Unique identifier for a controller instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControllerId(u64);

impl ControllerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Uninstalled,
    /// Install handler running.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and intercepting fetches.
    Activated,
    /// Replaced by a newer controller or unregistered.
    Redundant,
}

/// Inputs that drive [`ServiceWorkerState::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    InstallStarted,
    InstallFinished,
    ActivateStarted,
    ActivateFinished,
    Superseded,
}

impl ServiceWorkerState {
    /// Only an activated controller handles fetch events.
    pub fn can_intercept_fetch(&self) -> bool {
        matches!(self, ServiceWorkerState::Activated)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceWorkerState::Redundant)
    }

    /// Next state for an event, or a state error if the event is illegal here.
    pub fn transition(self, event: LifecycleEvent) -> Result<Self, ServiceWorkerError> {
        use LifecycleEvent::*;
        use ServiceWorkerState::*;

        match (self, event) {
            (Uninstalled, InstallStarted) => Ok(Installing),
            (Installing, InstallFinished) => Ok(Installed),
            (Installed, ActivateStarted) => Ok(Activating),
            (Activating, ActivateFinished) => Ok(Activated),
            (state, Superseded) if !state.is_terminal() => Ok(Redundant),
            (state, event) => Err(ServiceWorkerError::StateError(format!(
                "cannot apply {:?} while {}",
                event, state
            ))),
        }
    }
}

impl fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceWorkerState::Uninstalled => write!(f, "uninstalled"),
            ServiceWorkerState::Installing => write!(f, "installing"),
            ServiceWorkerState::Installed => write!(f, "installed"),
            ServiceWorkerState::Activating => write!(f, "activating"),
            ServiceWorkerState::Activated => write!(f, "activated"),
            ServiceWorkerState::Redundant => write!(f, "redundant"),
        }
    }
}
