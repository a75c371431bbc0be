//! Single-flight guard for periodic sweeps
//!
//! Prevents a sweep from overlapping with a previous run of itself when the
//! timer fires again before the earlier run has finished. Advisory and
//! process-local only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Capacity-1 gate backed by an atomic compare-and-swap
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    busy: Arc<AtomicBool>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to enter. Returns `None` if a run is already in progress.
    pub fn try_acquire(&self) -> Option<FlightGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard {
                busy: self.busy.clone(),
            })
    }

    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the gate on drop, including on early return or panic
#[derive(Debug)]
pub struct FlightGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_rejected() {
        let gate = SingleFlight::new();
        let guard = gate.try_acquire();
        assert!(guard.is_some());
        assert!(gate.is_running());
        assert!(gate.try_acquire().is_none());

        drop(guard);
        assert!(!gate.is_running());
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn test_clones_share_state() {
        let gate = SingleFlight::new();
        let other = gate.clone();
        let _guard = gate.try_acquire().unwrap();
        assert!(other.try_acquire().is_none());
    }
}
