use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lumen_core::{Error, Result};

/// Suggested back-off handed to callers rejected at the gate.
const RETRY_AFTER_MS: u64 = 100;

/// Bounded count of queries currently computing.
#[derive(Debug)]
pub struct Admission {
    in_flight: AtomicUsize,
    limit: usize,
}

/// Holds one admission slot; released on drop, whatever the exit path.
#[derive(Debug)]
pub struct AdmissionPermit {
    gate: Arc<Admission>,
}

impl Admission {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self { in_flight: AtomicUsize::new(0), limit })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Claims a slot or fails immediately; never waits.
    pub fn try_acquire(self: &Arc<Self>) -> Result<AdmissionPermit> {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.limit {
                return Err(Error::CapacityExceeded { limit: self.limit, retry_after_ms: RETRY_AFTER_MS });
            }
            match self.in_flight.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(AdmissionPermit { gate: Arc::clone(self) }),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_are_bounded_and_released_on_drop() {
        let gate = Admission::new(2);
        let a = gate.try_acquire().unwrap();
        let _b = gate.try_acquire().unwrap();
        let err = gate.try_acquire().unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { limit: 2, .. }));
        assert!(err.retry_after().is_some());
        drop(a);
        assert_eq!(gate.in_flight(), 1);
        assert!(gate.try_acquire().is_ok());
        assert_eq!(gate.in_flight(), 1, "temporary permit was dropped");
    }

    #[test]
    fn zero_limit_rejects_everything() {
        let gate = Admission::new(0);
        assert!(gate.try_acquire().is_err());
        assert_eq!(gate.in_flight(), 0);
    }
}
