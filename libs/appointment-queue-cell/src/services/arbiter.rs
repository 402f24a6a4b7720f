// libs/appointment-queue-cell/src/services/arbiter.rs
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{QueueError, StoreError};
use crate::models::{
    Appointment, AppointmentType, BookingCandidate, BookingReceipt, BookingStatus, MeetingStatus,
    PaymentStatus, PendingOperation, PendingWrite, QueueStatus, RetryReport, SlotKey, SyncState,
    LOCAL_ID_PREFIX,
};
use crate::services::normalizer::{canonical_time_label, decode_records, normalize, parse_calendar_date};
use crate::services::planes::{AppointmentQuery, DataPlanes};
use crate::services::reconciler::reconcile;
use crate::services::store::split_filters;

/// Decides whether a booking may be created and carries it through both
/// planes.
///
/// Arbitration is check-then-write against the reconciled view, serialized
/// per doctor within one process. Two devices racing for the same slot can
/// still both pass the check. Replays of pending bookings re-run the check
/// against the remote store alone.
pub struct BookingArbiter {
    planes: Arc<DataPlanes>,
}

impl BookingArbiter {
    pub fn new(planes: Arc<DataPlanes>) -> Self {
        Self { planes }
    }

    #[instrument(skip(self, candidate), fields(doctor = %candidate.doctor_id, patient = %candidate.patient_id))]
    pub async fn try_book(&self, candidate: BookingCandidate) -> Result<BookingReceipt, QueueError> {
        let slot = self.validate(&candidate)?;
        let _claim = self.planes.booking_locks.acquire(&slot.doctor).await;

        let query = AppointmentQuery::for_doctor(&slot.doctor).with_status(BookingStatus::Confirmed);
        let load = self.planes.load(&query).await;
        if load.degraded {
            warn!("Arbitrating {} against local data only", slot);
        }

        if let Some(holder) = find_slot_holder(&load.appointments, &slot, None) {
            info!("Slot {} already held by {}", slot, holder.label());
            return Err(QueueError::SlotTaken(slot.to_string()));
        }

        let now = self.planes.now();
        let local_id = format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4());
        let mut appointment = Appointment {
            id: Some(local_id.clone()),
            doctor_id: Some(slot.doctor.clone()),
            patient_id: Some(candidate.patient_id.trim().to_string()),
            date: Some(slot.date),
            time: Some(candidate.time.trim().to_string()),
            appointment_type: candidate.appointment_type,
            price: candidate.price,
            payment_status: PaymentStatus::Unpaid,
            status: BookingStatus::Confirmed,
            queue_status: QueueStatus::Waiting,
            booking_time: now,
            date_created: Some(now),
            started_at: None,
            completed_at: None,
            estimated_end_time: None,
            meeting_status: match candidate.appointment_type {
                AppointmentType::Video => Some(MeetingStatus::Waiting),
                AppointmentType::Onsite => None,
            },
            meeting_link: None,
            extra: Map::new(),
        };

        // Local first, so the booking survives whatever happens next.
        self.planes.upsert_local(&appointment)?;
        let pending_id = self.planes.pending.register_booking(&local_id, now)?;

        match self.submit(&appointment).await {
            Ok(confirmed_id) => {
                appointment.id = Some(confirmed_id.clone());
                self.planes.replace_local(&local_id, &appointment)?;
                self.planes.pending.resolve(&pending_id)?;
                info!("Booked {} as {}", slot, confirmed_id);
                Ok(BookingReceipt {
                    appointment_id: confirmed_id,
                    sync_state: SyncState::Confirmed,
                    appointment,
                })
            }
            Err(e) => {
                warn!("Remote write for {} failed, booking kept locally as {}: {}", slot, local_id, e);
                self.planes.pending.mark_failed(&pending_id, &e.to_string(), now)?;
                Ok(BookingReceipt {
                    appointment_id: local_id,
                    sync_state: SyncState::PendingRemote,
                    appointment,
                })
            }
        }
    }

    pub fn pending_writes(&self) -> Result<Vec<PendingWrite>, QueueError> {
        self.planes.pending.list()
    }

    /// Replays every unresolved pending write against the remote store.
    #[instrument(skip(self))]
    pub async fn retry_pending(&self) -> Result<RetryReport, QueueError> {
        let mut report = RetryReport::default();

        for write in self.planes.pending.unresolved()? {
            let outcome = match &write.operation {
                PendingOperation::Booking { local_id } => self.replay_booking(&write, local_id).await,
                PendingOperation::Patch { appointment_id, patch } => {
                    self.replay_patch(&write, appointment_id, patch.clone()).await
                }
            }?;

            match outcome {
                Replay::Resolved => report.resolved.push(write.id),
                Replay::StillPending => report.still_pending.push(write.id),
                Replay::Conflicted => report.conflicted.push(write.id),
            }
        }

        info!(
            "Pending replay: {} resolved, {} still pending, {} conflicted",
            report.resolved.len(),
            report.still_pending.len(),
            report.conflicted.len()
        );
        Ok(report)
    }

    /// Cancelling frees the slot; completed visits cannot be cancelled.
    #[instrument(skip(self))]
    pub async fn cancel(&self, appointment_id: &str) -> Result<Appointment, QueueError> {
        let mut appointment = self.planes.find(appointment_id).await?;

        if appointment.status == BookingStatus::Cancelled {
            return Err(QueueError::InvalidBookingChange(
                appointment_id.to_string(),
                "already cancelled".to_string(),
            ));
        }
        if appointment.queue_status == QueueStatus::Completed {
            return Err(QueueError::InvalidBookingChange(
                appointment_id.to_string(),
                "visit already completed".to_string(),
            ));
        }

        appointment.status = BookingStatus::Cancelled;
        let mut patch = Map::new();
        patch.insert("status".to_string(), json!(BookingStatus::Cancelled.as_str()));
        self.planes.persist_patch(&appointment, patch).await?;

        info!("Appointment {} cancelled", appointment_id);
        Ok(appointment)
    }

    /// Records payment, which is what admits a booking to the live queue.
    #[instrument(skip(self))]
    pub async fn mark_paid(&self, appointment_id: &str) -> Result<Appointment, QueueError> {
        let mut appointment = self.planes.find(appointment_id).await?;

        if appointment.status == BookingStatus::Cancelled {
            return Err(QueueError::InvalidBookingChange(
                appointment_id.to_string(),
                "booking is cancelled".to_string(),
            ));
        }
        if appointment.payment_status == PaymentStatus::Paid {
            debug!("Appointment {} already paid", appointment_id);
            return Ok(appointment);
        }

        appointment.payment_status = PaymentStatus::Paid;
        let mut patch = Map::new();
        patch.insert("paymentStatus".to_string(), json!(PaymentStatus::Paid.as_str()));
        self.planes.persist_patch(&appointment, patch).await?;

        info!("Appointment {} marked paid", appointment_id);
        Ok(appointment)
    }

    fn validate(&self, candidate: &BookingCandidate) -> Result<SlotKey, QueueError> {
        if candidate.doctor_id.trim().is_empty() {
            return Err(QueueError::ValidationError("doctorId is required".to_string()));
        }
        if candidate.patient_id.trim().is_empty() {
            return Err(QueueError::ValidationError("patientId is required".to_string()));
        }
        if let Some(price) = candidate.price {
            if !price.is_finite() || price < 0.0 {
                return Err(QueueError::ValidationError("price must be a non-negative amount".to_string()));
            }
        }

        let date = parse_calendar_date(&candidate.date).ok_or_else(|| {
            QueueError::ValidationError(format!("unrecognized date '{}'", candidate.date))
        })?;
        if date < self.planes.today() {
            return Err(QueueError::ValidationError(format!("{} is in the past", date)));
        }
        if canonical_time_label(&candidate.time).is_none() {
            return Err(QueueError::ValidationError("time is required".to_string()));
        }

        SlotKey::new(&candidate.doctor_id, date, &candidate.time)
            .ok_or_else(|| QueueError::ValidationError("incomplete slot".to_string()))
    }

    async fn submit(&self, appointment: &Appointment) -> Result<String, QueueError> {
        let mut record = appointment.to_record()?;
        if let Value::Object(fields) = &mut record {
            fields.remove("id");
        }
        Ok(self.planes.remote.add(self.planes.collection(), record).await?)
    }

    async fn replay_booking(&self, write: &PendingWrite, local_id: &str) -> Result<Replay, QueueError> {
        let now = self.planes.now();
        let local_copy = self
            .planes
            .local_records()
            .iter()
            .map(|raw| normalize(raw, now))
            .find(|a| a.id.as_deref() == Some(local_id));

        let Some(mut appointment) = local_copy else {
            debug!("Local copy {} is gone; dropping its pending write", local_id);
            self.planes.pending.resolve(&write.id)?;
            return Ok(Replay::Resolved);
        };
        if appointment.status == BookingStatus::Cancelled {
            debug!("Local booking {} was cancelled before it synced", local_id);
            self.planes.pending.resolve(&write.id)?;
            return Ok(Replay::Resolved);
        }

        let Some(slot) = appointment.slot_key() else {
            warn!("Pending booking {} has no doctor, date or time; giving up on it", local_id);
            self.planes.pending.mark_conflicted(&write.id, None, now)?;
            return Ok(Replay::Conflicted);
        };
        let _claim = self.planes.booking_locks.acquire(&slot.doctor).await;
        // Older clients stored the doctor id as typed.
        appointment.doctor_id = Some(slot.doctor.clone());

        // Remote alone: the local plane contains this very booking.
        let query = AppointmentQuery::for_doctor(&slot.doctor).with_status(BookingStatus::Confirmed);
        let filters = query.remote_filters();
        let (server, _) = split_filters(&filters, self.planes.settings.server_filter_limit);
        let remote = match self.planes.remote.get(self.planes.collection(), &server).await {
            Ok(values) => decode_records(&values),
            Err(e) => {
                self.planes.pending.mark_failed(&write.id, &e.to_string(), now)?;
                return Ok(Replay::StillPending);
            }
        };
        let remote_view: Vec<Appointment> = reconcile(&[], &remote, now)
            .into_iter()
            .filter(|a| query.matches(a))
            .collect();

        if let Some(holder) = find_slot_holder(&remote_view, &slot, appointment.composite_key().as_deref()) {
            let holder_id = holder.id.clone();
            warn!("Pending booking {} lost slot {} to {}", local_id, slot, holder.label());
            appointment.status = BookingStatus::Cancelled;
            self.planes.upsert_local(&appointment)?;
            self.planes.pending.mark_conflicted(&write.id, holder_id, now)?;
            return Ok(Replay::Conflicted);
        }

        if let Some(same) = remote_view
            .iter()
            .find(|a| a.is_active() && a.composite_key().is_some() && a.composite_key() == appointment.composite_key())
        {
            // An earlier replay reached the store but the confirmation was lost.
            debug!("Pending booking {} already present remotely as {}", local_id, same.label());
            appointment.id = same.id.clone();
        } else {
            match self.submit(&appointment).await {
                Ok(id) => appointment.id = Some(id),
                Err(e) => {
                    self.planes.pending.mark_failed(&write.id, &e.to_string(), now)?;
                    return Ok(Replay::StillPending);
                }
            }
        }

        self.planes.replace_local(local_id, &appointment)?;
        self.planes.pending.resolve(&write.id)?;
        info!("Pending booking {} confirmed as {}", local_id, appointment.label());
        Ok(Replay::Resolved)
    }

    async fn replay_patch(
        &self,
        write: &PendingWrite,
        appointment_id: &str,
        patch: Value,
    ) -> Result<Replay, QueueError> {
        let now = self.planes.now();
        match self.planes.remote.update(self.planes.collection(), appointment_id, patch).await {
            Ok(()) => {
                self.planes.pending.resolve(&write.id)?;
                Ok(Replay::Resolved)
            }
            Err(StoreError::NotFound(_)) => {
                warn!("Pending patch target {} no longer exists remotely", appointment_id);
                self.planes.pending.mark_conflicted(&write.id, None, now)?;
                Ok(Replay::Conflicted)
            }
            Err(e) => {
                self.planes.pending.mark_failed(&write.id, &e.to_string(), now)?;
                Ok(Replay::StillPending)
            }
        }
    }
}

enum Replay {
    Resolved,
    StillPending,
    Conflicted,
}

/// An active appointment holding `slot`, ignoring the booking identified by
/// `own_composite`.
fn find_slot_holder<'a>(
    appointments: &'a [Appointment],
    slot: &SlotKey,
    own_composite: Option<&str>,
) -> Option<&'a Appointment> {
    appointments.iter().find(|a| {
        a.is_active()
            && a.slot_key().as_ref() == Some(slot)
            && (own_composite.is_none() || a.composite_key().as_deref() != own_composite)
    })
}
