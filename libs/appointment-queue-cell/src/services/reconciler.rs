// libs/appointment-queue-cell/src/services/reconciler.rs
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::models::{Appointment, BookingStatus, RawAppointment};
use crate::services::normalizer::normalize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plane {
    Remote,
    Local,
}

/// Merges the local-cache set and the remote-store set into one canonical,
/// deduplicated set.
///
/// Remote records are inserted first, so whenever a local record collides
/// with one (same confirmed id, or the same patient booking the same slot)
/// the remote version wins. A local record only survives while
/// its remote counterpart has not arrived yet. Output order is insertion
/// order; callers apply their own ordering.
pub fn reconcile(
    local: &[RawAppointment],
    remote: &[RawAppointment],
    now: DateTime<Utc>,
) -> Vec<Appointment> {
    let mut merger = Merger::default();

    for raw in remote {
        merger.offer(normalize(raw, now), Plane::Remote);
    }
    for raw in local {
        merger.offer(normalize(raw, now), Plane::Local);
    }

    debug!(
        "Reconciled {} remote + {} local records into {} canonical ({} shadowed, {} malformed)",
        remote.len(),
        local.len(),
        merger.canonical.len(),
        merger.shadowed,
        merger.malformed
    );

    merger.canonical
}

/// Re-merges an already canonical set with nothing new; a no-op by construction.
pub fn recanonicalize(canonical: &[Appointment], now: DateTime<Utc>) -> Vec<Appointment> {
    let raw: Vec<RawAppointment> = canonical.iter().map(Appointment::to_raw).collect();
    reconcile(&raw, &[], now)
}

#[derive(Default)]
struct Merger {
    canonical: Vec<Appointment>,
    by_id: HashSet<String>,
    /// Composite key -> confirmed if any live record claims it.
    by_composite: HashMap<String, BookingStatus>,
    shadowed: usize,
    malformed: usize,
}

impl Merger {
    fn offer(&mut self, appointment: Appointment, plane: Plane) {
        let composite = appointment.composite_key();

        match appointment.confirmed_id().map(str::to_string) {
            Some(id) => {
                if self.by_id.contains(&id) {
                    debug!("Dropping {:?} copy of {}: id already merged", plane, id);
                    self.shadowed += 1;
                    return;
                }
                if self.composite_shadows(composite.as_deref(), &appointment) {
                    debug!("Dropping {:?} record {}: same booking already merged under another id", plane, id);
                    self.shadowed += 1;
                    return;
                }
                self.by_id.insert(id);
            }
            None => {
                let Some(key) = composite.as_deref() else {
                    warn!(
                        "Excluding malformed {:?} appointment without id or slot identity (patient {:?})",
                        plane, appointment.patient_id
                    );
                    self.malformed += 1;
                    return;
                };
                if self.composite_shadows(Some(key), &appointment) {
                    debug!("Dropping unconfirmed {:?} record {}: already merged", plane, key);
                    self.shadowed += 1;
                    return;
                }
            }
        }

        if let Some(key) = composite {
            let claim = self.by_composite.entry(key).or_insert(appointment.status);
            if appointment.status == BookingStatus::Confirmed {
                *claim = BookingStatus::Confirmed;
            }
        }
        self.canonical.push(appointment);
    }

    /// A cancelled booking does not hide a live one for the same patient and slot.
    fn composite_shadows(&self, key: Option<&str>, candidate: &Appointment) -> bool {
        match key.and_then(|k| self.by_composite.get(k)) {
            Some(BookingStatus::Cancelled) => candidate.status == BookingStatus::Cancelled,
            Some(BookingStatus::Confirmed) => true,
            None => false,
        }
    }
}
