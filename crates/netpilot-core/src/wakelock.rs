use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakelockStatus {
    pub held: bool,
    pub serial: u64,
    pub caused_by: Option<String>,
}

/// The single process-wide hold taken while the default network changes.
/// Each acquisition gets a fresh serial; releases naming an older serial are
/// ignored.
#[derive(Debug, Default)]
pub struct TransitionWakelock {
    inner: Mutex<WakelockStatus>,
}

impl TransitionWakelock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new serial, or `None` when a hold is already in place.
    pub fn acquire(&self, tag: &str) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.held {
            debug!("Transition wakelock already held by {:?}", inner.caused_by);
            return None;
        }
        inner.held = true;
        inner.serial += 1;
        inner.caused_by = Some(tag.to_string());
        info!("Transition wakelock #{} acquired for {}", inner.serial, tag);
        Some(inner.serial)
    }

    pub fn release(&self, serial: u64) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.held || inner.serial != serial {
            debug!(
                "Ignoring stale wakelock release #{} (current #{})",
                serial, inner.serial
            );
            return false;
        }
        inner.held = false;
        info!(
            "Transition wakelock #{} released ({})",
            serial,
            inner.caused_by.take().unwrap_or_default()
        );
        true
    }

    /// Serial of the hold currently in place.
    pub fn held_serial(&self) -> Option<u64> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.held.then_some(inner.serial)
    }

    pub fn status(&self) -> WakelockStatus {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_release_is_ignored() {
        let lock = TransitionWakelock::new();
        let first = lock.acquire("failover").unwrap();
        assert!(lock.acquire("again").is_none());
        assert!(lock.release(first));

        let second = lock.acquire("switch").unwrap();
        assert_ne!(first, second);
        assert!(!lock.release(first));
        assert_eq!(lock.held_serial(), Some(second));
        assert!(lock.release(second));
        assert!(!lock.status().held);
    }
}
