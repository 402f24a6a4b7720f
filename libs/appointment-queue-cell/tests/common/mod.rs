#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};

use appointment_queue_cell::models::{AppointmentType, BookingCandidate};
use appointment_queue_cell::services::{
    BookingArbiter, DataPlanes, LocalCache, LocalStore, ManualClock, MemoryRemoteStore, QueueController,
    SyncController,
};
use shared_config::QueueSettings;
use shared_models::session::SessionContext;

pub const DOCTOR: &str = "dr@x.com";
pub const DAY: &str = "2025-03-01";

/// 08:00 UTC on the clinic day used throughout the tests.
pub fn opening() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
}

/// One client session wired to in-process stores.
pub struct TestClient {
    pub remote: MemoryRemoteStore,
    pub cache: LocalCache,
    pub clock: ManualClock,
    pub session: SessionContext,
    pub planes: Arc<DataPlanes>,
}

impl TestClient {
    pub fn new() -> Self {
        Self::with_parts(MemoryRemoteStore::new(), LocalCache::in_memory(), ManualClock::new(opening()))
    }

    pub fn with_cache(cache: LocalCache) -> Self {
        Self::with_parts(MemoryRemoteStore::new(), cache, ManualClock::new(opening()))
    }

    pub fn with_parts(remote: MemoryRemoteStore, cache: LocalCache, clock: ManualClock) -> Self {
        let session = SessionContext::anonymous();
        let planes = Arc::new(DataPlanes::new(
            Arc::new(remote.clone()),
            Arc::new(cache.clone()),
            Arc::new(clock.clone()),
            QueueSettings::default(),
        ));
        Self {
            remote,
            cache,
            clock,
            session,
            planes,
        }
    }

    /// A second tab: same remote store, same cache storage, new session.
    pub fn second_tab(&self) -> Self {
        Self::with_parts(self.remote.clone(), self.cache.attach(), self.clock.clone())
    }

    /// Another device: same remote store, its own cache.
    pub fn other_device(&self) -> Self {
        Self::with_parts(self.remote.clone(), LocalCache::in_memory(), self.clock.clone())
    }

    pub fn arbiter(&self) -> BookingArbiter {
        BookingArbiter::new(self.planes.clone())
    }

    pub fn controller(&self) -> QueueController {
        QueueController::new(self.planes.clone(), self.session.clone())
    }

    pub fn sync(&self) -> SyncController {
        SyncController::new(self.planes.clone())
    }

    pub fn seed_remote(&self, records: Vec<Value>) {
        self.remote.seed("appointments", records);
    }

    pub fn seed_local(&self, records: Vec<Value>) {
        self.cache.write("appointments", records).unwrap();
    }

    pub fn local_records(&self) -> Vec<Value> {
        self.cache.read("appointments").unwrap()
    }

    pub fn remote_records(&self) -> Vec<Value> {
        self.remote.records("appointments")
    }

    pub fn remote_record(&self, id: &str) -> Value {
        self.remote_records()
            .into_iter()
            .find(|r| r["id"] == id)
            .unwrap_or_else(|| panic!("no remote record {}", id))
    }
}

pub fn candidate(patient: &str, time: &str) -> BookingCandidate {
    BookingCandidate {
        doctor_id: DOCTOR.to_string(),
        patient_id: patient.to_string(),
        date: DAY.to_string(),
        time: time.to_string(),
        appointment_type: AppointmentType::Onsite,
        price: Some(50.0),
    }
}

/// A confirmed, paid appointment booked `minutes` after opening.
pub fn paid_appointment(id: &str, patient: &str, minutes: i64, queue_status: &str) -> Value {
    json!({
        "id": id,
        "doctorId": DOCTOR,
        "patientId": patient,
        "date": DAY,
        "time": format!("{:02}:00", 9 + minutes % 10),
        "appointmentType": "onsite",
        "status": "confirmed",
        "paymentStatus": "paid",
        "queueStatus": queue_status,
        "bookingTime": (opening() + Duration::minutes(minutes)).to_rfc3339(),
    })
}
