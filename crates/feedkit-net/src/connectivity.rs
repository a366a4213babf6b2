//! Online/offline signal exposed by the hosting environment.

use std::sync::atomic::{AtomicU8, Ordering};
use tracing::debug;

/// Source of the environment's "is the browser online" flag.
///
/// `None` means the host cannot tell; callers treat it like online.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> Option<bool>;
}

const UNKNOWN: u8 = 0;
const ONLINE: u8 = 1;
const OFFLINE: u8 = 2;

/// Connectivity flag the host flips from its own network observers.
#[derive(Debug)]
pub struct NetworkStatus {
    state: AtomicU8,
}

impl NetworkStatus {
    /// Status that has not been reported yet.
    pub fn unknown() -> Self {
        Self {
            state: AtomicU8::new(UNKNOWN),
        }
    }

    pub fn online() -> Self {
        Self {
            state: AtomicU8::new(ONLINE),
        }
    }

    pub fn offline() -> Self {
        Self {
            state: AtomicU8::new(OFFLINE),
        }
    }

    /// Record a connectivity change.
    pub fn set_online(&self, online: bool) {
        let next = if online { ONLINE } else { OFFLINE };
        let prev = self.state.swap(next, Ordering::SeqCst);
        if prev != next {
            debug!(online, "Connectivity changed");
        }
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::unknown()
    }
}

impl Connectivity for NetworkStatus {
    fn is_online(&self) -> Option<bool> {
        match self.state.load(Ordering::SeqCst) {
            ONLINE => Some(true),
            OFFLINE => Some(false),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_unknown() {
        assert_eq!(NetworkStatus::default().is_online(), None);
    }

    #[test]
    fn test_transitions() {
        let status = NetworkStatus::online();
        assert_eq!(status.is_online(), Some(true));

        status.set_online(false);
        assert_eq!(status.is_online(), Some(false));

        status.set_online(true);
        assert_eq!(status.is_online(), Some(true));
    }
}
