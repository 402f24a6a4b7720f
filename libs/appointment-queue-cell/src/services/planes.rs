// libs/appointment-queue-cell/src/services/planes.rs
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use shared_config::QueueSettings;

use crate::error::QueueError;
use crate::models::{
    canonical_doctor_id, Appointment, BookingStatus, PaymentStatus, RawAppointment, SubscriptionRequest,
};
use crate::services::clock::Clock;
use crate::services::local_cache::{update_records, LocalStore};
use crate::services::locks::BookingLocks;
use crate::services::normalizer::{decode_records, normalize};
use crate::services::pending::PendingWrites;
use crate::services::reconciler::reconcile;
use crate::services::store::{split_filters, Filter, RemoteStore};

/// Which slice of the collection a caller needs. The doctor id is kept in
/// canonical form, which is what the store filters on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentQuery {
    pub doctor_id: String,
    pub status: Option<BookingStatus>,
    pub payment_status: Option<PaymentStatus>,
}

impl AppointmentQuery {
    pub fn for_doctor(doctor_id: &str) -> Self {
        Self {
            doctor_id: canonical_doctor_id(doctor_id),
            status: None,
            payment_status: None,
        }
    }

    /// Everything the queue state machine may need for a doctor: confirmed
    /// bookings of any payment state and date.
    pub fn queue_candidates(doctor_id: &str) -> Self {
        Self::for_doctor(doctor_id).with_status(BookingStatus::Confirmed)
    }

    /// Confirmed and paid: what the live queue shows.
    pub fn live_queue(doctor_id: &str) -> Self {
        Self {
            status: Some(BookingStatus::Confirmed),
            payment_status: Some(PaymentStatus::Paid),
            ..Self::for_doctor(doctor_id)
        }
    }

    pub fn with_status(mut self, status: BookingStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Field filters in the order the remote store should receive them.
    pub fn remote_filters(&self) -> Vec<Filter> {
        let mut filters = vec![Filter::eq("doctorId", self.doctor_id.clone())];
        if let Some(status) = self.status {
            filters.push(Filter::eq("status", status.as_str()));
        }
        if let Some(payment) = self.payment_status {
            filters.push(Filter::eq("paymentStatus", payment.as_str()));
        }
        filters
    }

    /// Client-side check on normalized data; applied to every result no
    /// matter how many predicates the store honoured.
    pub fn matches(&self, appointment: &Appointment) -> bool {
        appointment.belongs_to_doctor(&self.doctor_id)
            && self.status.map_or(true, |s| appointment.status == s)
            && self.payment_status.map_or(true, |p| appointment.payment_status == p)
    }
}

impl From<&SubscriptionRequest> for AppointmentQuery {
    fn from(request: &SubscriptionRequest) -> Self {
        Self {
            doctor_id: canonical_doctor_id(&request.doctor_id),
            status: request.status,
            payment_status: request.payment_status,
        }
    }
}

/// Canonical read result.
#[derive(Debug, Clone)]
pub struct CanonicalLoad {
    pub appointments: Vec<Appointment>,
    /// The remote plane could not be reached; only local data was used.
    pub degraded: bool,
}

/// Both data planes plus the pieces every writer needs alongside them.
pub struct DataPlanes {
    pub remote: Arc<dyn RemoteStore>,
    pub local: Arc<dyn LocalStore>,
    pub clock: Arc<dyn Clock>,
    pub settings: QueueSettings,
    pub pending: PendingWrites,
    pub booking_locks: BookingLocks,
}

impl DataPlanes {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalStore>,
        clock: Arc<dyn Clock>,
        settings: QueueSettings,
    ) -> Self {
        let pending = PendingWrites::new(local.clone(), &settings.local_cache_key);
        Self {
            remote,
            local,
            clock,
            settings,
            pending,
            booking_locks: BookingLocks::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Calendar day at the clinic.
    pub fn today(&self) -> NaiveDate {
        let offset = Duration::minutes(i64::from(self.settings.clinic_utc_offset_minutes));
        (self.now() + offset).date_naive()
    }

    pub fn collection(&self) -> &str {
        &self.settings.appointments_collection
    }

    pub fn cache_key(&self) -> &str {
        &self.settings.local_cache_key
    }

    /// Every record in the local cache, undecodable entries skipped.
    pub fn local_records(&self) -> Vec<RawAppointment> {
        match self.local.read(self.cache_key()) {
            Ok(values) => decode_records(&values),
            Err(e) => {
                warn!("Local cache unreadable, treating as empty: {}", e);
                Vec::new()
            }
        }
    }

    /// Reads both planes and reconciles them. A remote failure degrades to
    /// local data instead of failing the read.
    pub async fn load(&self, query: &AppointmentQuery) -> CanonicalLoad {
        let (server_filters, _) = split_filters(&query.remote_filters(), self.settings.server_filter_limit);

        let (remote, degraded) = match self.remote.get(self.collection(), &server_filters).await {
            Ok(values) => (decode_records(&values), false),
            Err(e) => {
                warn!("Remote read for doctor {} failed, using local data only: {}", query.doctor_id, e);
                (Vec::new(), true)
            }
        };

        let appointments = self.merge(&remote, query);
        CanonicalLoad { appointments, degraded }
    }

    /// Reconciles an already fetched remote set with the current local set.
    pub fn merge(&self, remote: &[RawAppointment], query: &AppointmentQuery) -> Vec<Appointment> {
        let local = self.local_records();
        reconcile(&local, remote, self.now())
            .into_iter()
            .filter(|a| query.matches(a))
            .collect()
    }

    /// Finds one appointment by confirmed or placeholder id across both planes.
    pub async fn find(&self, appointment_id: &str) -> Result<Appointment, QueueError> {
        let remote = match self
            .remote
            .get(self.collection(), &[Filter::eq("id", appointment_id)])
            .await
        {
            Ok(values) => decode_records(&values),
            Err(e) => {
                warn!("Remote lookup of {} failed, using local data only: {}", appointment_id, e);
                Vec::new()
            }
        };

        reconcile(&self.local_records(), &remote, self.now())
            .into_iter()
            .find(|a| a.id.as_deref() == Some(appointment_id))
            .ok_or_else(|| QueueError::AppointmentNotFound(appointment_id.to_string()))
    }

    /// Inserts or replaces the local copy of `appointment`.
    pub fn upsert_local(&self, appointment: &Appointment) -> Result<(), QueueError> {
        self.replace_local(&appointment.label(), appointment)
    }

    /// Replaces the local record known as `previous_label` (placeholder id,
    /// confirmed id, or composite key) with `appointment`, appending when absent.
    pub fn replace_local(&self, previous_label: &str, appointment: &Appointment) -> Result<(), QueueError> {
        let record = appointment.to_record()?;
        let now = self.now();

        update_records(self.local.as_ref(), self.cache_key(), |values| {
            let position = values.iter().position(|value| {
                serde_json::from_value::<RawAppointment>(value.clone())
                    .map(|raw| normalize(&raw, now).label() == previous_label)
                    .unwrap_or(false)
            });
            match position {
                Some(index) => values[index] = record,
                None => values.push(record),
            }
            Ok::<(), QueueError>(())
        })?;
        debug!("Local copy of {} written as {}", previous_label, appointment.label());
        Ok(())
    }

    /// Writes a field patch to the remote store, then mirrors the patched
    /// appointment locally. A remote failure registers a pending patch.
    ///
    /// Returns whether the remote write went through.
    pub async fn persist_patch(
        &self,
        updated: &Appointment,
        patch: Map<String, Value>,
    ) -> Result<bool, QueueError> {
        let mut synced = false;

        match updated.confirmed_id() {
            Some(id) => match self.remote.update(self.collection(), id, Value::Object(patch.clone())).await {
                Ok(()) => synced = true,
                Err(e) => {
                    warn!("Remote update of {} failed, keeping it pending: {}", id, e);
                    self.pending
                        .register_patch(id, Value::Object(patch), &e.to_string(), self.now())?;
                }
            },
            None => {
                // The pending booking replay carries the whole record.
                debug!("{} has no confirmed id yet; patch stays local", updated.label());
            }
        }

        self.upsert_local(updated)?;
        Ok(synced)
    }
}
