//! # Collector Slot
//!
//! At most one producer connection is admitted at a time. Admission hands back a
//! [`CollectorLease`]; the slot is cleared when that lease is dropped, which is
//! how the connection task releases it on a graceful close, a read error, or a
//! panic alike. A second connection gets [`RelayError::AdmissionRejected`] and
//! the current holder is not touched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Message sent to a rejected collector before it is closed.
pub const COLLECTOR_REJECTION: &str = "Only one collector connection allowed";

/// Errors raised by the relay's admission control.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// Another collector already holds the slot.
    #[error("{}", COLLECTOR_REJECTION)]
    AdmissionRejected,
}

/// The single-writer slot.
#[derive(Debug, Default)]
pub struct CollectorSlot {
    current: Mutex<Option<u64>>,
    next_id: AtomicU64,
}

impl CollectorSlot {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<u64>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Try Admit
    ///
    /// Claims the slot if it is empty. The check and the claim happen under one
    /// lock so two simultaneous attempts can never both succeed.
    pub fn try_admit(self: &Arc<Self>) -> Result<CollectorLease, RelayError> {
        let mut current = self.lock();
        if current.is_some() {
            return Err(RelayError::AdmissionRejected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        *current = Some(id);
        log::info!("Collector {} admitted", id);

        Ok(CollectorLease {
            slot: Arc::clone(self),
            id,
        })
    }

    /// Whether a collector currently holds the slot.
    pub fn is_occupied(&self) -> bool {
        self.lock().is_some()
    }

    /// Identifier of the current holder, if any.
    pub fn holder(&self) -> Option<u64> {
        *self.lock()
    }

    fn release(&self, id: u64) {
        let mut current = self.lock();
        if *current == Some(id) {
            *current = None;
            log::info!("Collector {} released the slot", id);
        }
    }
}

/// Proof of admission. Dropping it frees the slot.
#[derive(Debug)]
pub struct CollectorLease {
    slot: Arc<CollectorSlot>,
    id: u64,
}

impl CollectorLease {
    /// Identifier assigned at admission.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CollectorLease {
    fn drop(&mut self) {
        self.slot.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_collector_is_admitted() {
        let slot = Arc::new(CollectorSlot::new());
        let lease = slot.try_admit().expect("slot is empty");
        assert!(slot.is_occupied());
        assert_eq!(slot.holder(), Some(lease.id()));
    }

    #[test]
    fn second_collector_is_rejected_without_disturbing_the_first() {
        let slot = Arc::new(CollectorSlot::new());
        let first = slot.try_admit().unwrap();

        let second = slot.try_admit();
        assert_eq!(second.unwrap_err(), RelayError::AdmissionRejected);
        assert_eq!(slot.holder(), Some(first.id()));
    }

    #[test]
    fn dropping_the_lease_clears_the_slot() {
        let slot = Arc::new(CollectorSlot::new());
        let lease = slot.try_admit().unwrap();
        drop(lease);
        assert!(!slot.is_occupied());

        let again = slot.try_admit().expect("slot was released");
        assert!(again.id() > 0);
    }

    #[test]
    fn rejection_message_matches_the_wire_text() {
        assert_eq!(
            RelayError::AdmissionRejected.to_string(),
            "Only one collector connection allowed"
        );
    }

    #[test]
    fn concurrent_admissions_admit_exactly_one() {
        let slot = Arc::new(CollectorSlot::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let slot = Arc::clone(&slot);
                std::thread::spawn(move || slot.try_admit().ok())
            })
            .collect();

        let leases: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(leases.len(), 1);
    }
}
