// libs/appointment-queue-cell/src/services/locks.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OwnedMutexGuard;
use tracing::trace;

/// Locks a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One async lock per doctor. Arbitration holds it from the slot check until
/// the booking is written, so bookings made through the same planes never
/// interleave for a doctor.
#[derive(Default)]
pub struct BookingLocks {
    doctors: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl BookingLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// `doctor` must already be canonical (see `canonical_doctor_id`).
    pub async fn acquire(&self, doctor: &str) -> OwnedMutexGuard<()> {
        let doctor_lock = lock(&self.doctors).entry(doctor.to_string()).or_default().clone();
        trace!("Waiting for booking lock of {}", doctor);
        doctor_lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_doctor_waits_other_doctor_does_not() {
        let locks = Arc::new(BookingLocks::new());
        let held = locks.acquire("dr@x.com").await;

        let other = tokio::time::timeout(Duration::from_millis(50), locks.acquire("dr@y.com")).await;
        assert!(other.is_ok());

        let same = tokio::time::timeout(Duration::from_millis(50), locks.acquire("dr@x.com")).await;
        assert!(same.is_err());

        drop(held);
        let again = tokio::time::timeout(Duration::from_millis(50), locks.acquire("dr@x.com")).await;
        assert!(again.is_ok());
    }
}
