// libs/appointment-queue-cell/src/models.rs
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::services::normalizer::canonical_time_label;

/// Prefix of the placeholder ids given to bookings that have only been
/// written to the local cache.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// An id is confirmed once the authoritative store has assigned it.
pub fn is_confirmed_id(id: &str) -> bool {
    let id = id.trim();
    !id.is_empty() && !id.starts_with(LOCAL_ID_PREFIX)
}

/// Doctor ids are emails and compare case-insensitively. Everything written
/// or queried uses this form so exact-match store filters agree.
pub fn canonical_doctor_id(doctor_id: &str) -> String {
    doctor_id.trim().to_lowercase()
}

// ==============================================================================
// TEMPORAL VALUES
// ==============================================================================

/// Timestamp wrapper written by document stores (`{ seconds, nanoseconds }`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTimestamp {
    #[serde(alias = "_seconds")]
    pub seconds: i64,
    #[serde(default, alias = "_nanoseconds")]
    pub nanoseconds: u32,
}

/// Every shape a point in time arrives in. Only the normalizer converts these
/// into `DateTime<Utc>` / `NaiveDate`.
///
/// Strings always decode as `IsoString` so the written text (and its offset)
/// survives until normalization; `NativeInstant` is built in-process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemporalValue {
    EpochSeconds(i64),
    ServerTimestamp(ServerTimestamp),
    IsoString(String),
    NativeInstant(DateTime<Utc>),
}

// ==============================================================================
// LIFECYCLE ENUMS
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueStatus {
    Waiting,
    InProgress,
    Completed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Waiting => "waiting",
            QueueStatus::InProgress => "in-progress",
            QueueStatus::Completed => "completed",
        }
    }

    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match normalize_token(raw).as_str() {
            "waiting" | "queued" => Some(QueueStatus::Waiting),
            "inprogress" | "started" | "serving" => Some(QueueStatus::InProgress),
            "completed" | "done" => Some(QueueStatus::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Completed)
    }

    /// Queue states only move forward, one step at a time.
    pub fn can_transition_to(&self, target: &QueueStatus) -> bool {
        matches!(
            (self, target),
            (QueueStatus::Waiting, QueueStatus::InProgress)
                | (QueueStatus::InProgress, QueueStatus::Completed)
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match normalize_token(raw).as_str() {
            "confirmed" | "booked" => Some(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Paid => "paid",
        }
    }

    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match normalize_token(raw).as_str() {
            "paid" | "succeeded" => Some(PaymentStatus::Paid),
            "unpaid" | "pending" => Some(PaymentStatus::Unpaid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentType {
    Video,
    Onsite,
}

impl AppointmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentType::Video => "video",
            AppointmentType::Onsite => "onsite",
        }
    }

    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match normalize_token(raw).as_str() {
            "video" | "online" | "telehealth" => Some(AppointmentType::Video),
            "onsite" | "inperson" | "clinic" => Some(AppointmentType::Onsite),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeetingStatus {
    Waiting,
    Started,
    Joined,
}

impl MeetingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeetingStatus::Waiting => "waiting",
            MeetingStatus::Started => "started",
            MeetingStatus::Joined => "joined",
        }
    }

    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match normalize_token(raw).as_str() {
            "waiting" => Some(MeetingStatus::Waiting),
            "started" => Some(MeetingStatus::Started),
            "joined" => Some(MeetingStatus::Joined),
            _ => None,
        }
    }
}

fn normalize_token(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

// ==============================================================================
// RECORDS
// ==============================================================================

/// An appointment exactly as a store hands it over: every field optional,
/// heterogeneous temporal shapes, unknown fields kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAppointment {
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, alias = "doctor_id", deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub doctor_id: Option<String>,
    #[serde(default, alias = "patient_id", deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<TemporalValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, alias = "appointment_type", skip_serializing_if = "Option::is_none")]
    pub appointment_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_number", skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, alias = "payment_status", skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, alias = "queue_status", skip_serializing_if = "Option::is_none")]
    pub queue_status: Option<String>,
    #[serde(default, alias = "booking_time", skip_serializing_if = "Option::is_none")]
    pub booking_time: Option<TemporalValue>,
    #[serde(default, alias = "date_created", alias = "createdAt", alias = "created_at", skip_serializing_if = "Option::is_none")]
    pub date_created: Option<TemporalValue>,
    #[serde(default, alias = "started_at", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<TemporalValue>,
    #[serde(default, alias = "completed_at", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<TemporalValue>,
    #[serde(default, alias = "estimated_end_time", skip_serializing_if = "Option::is_none")]
    pub estimated_end_time: Option<TemporalValue>,
    #[serde(default, alias = "meeting_status", skip_serializing_if = "Option::is_none")]
    pub meeting_status: Option<String>,
    #[serde(default, alias = "meeting_link", skip_serializing_if = "Option::is_none")]
    pub meeting_link: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A normalized appointment. Identity fields stay optional because records
/// with a confirmed id are passed through even when they are incomplete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: Option<String>,
    pub doctor_id: Option<String>,
    pub patient_id: Option<String>,
    pub date: Option<NaiveDate>,
    pub time: Option<String>,
    pub appointment_type: AppointmentType,
    pub price: Option<f64>,
    pub payment_status: PaymentStatus,
    pub status: BookingStatus,
    pub queue_status: QueueStatus,
    pub booking_time: DateTime<Utc>,
    pub date_created: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_end_time: Option<DateTime<Utc>>,
    pub meeting_status: Option<MeetingStatus>,
    pub meeting_link: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Appointment {
    /// The store-assigned id, if this record has made the round trip.
    pub fn confirmed_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| is_confirmed_id(id))
    }

    pub fn is_active(&self) -> bool {
        self.status != BookingStatus::Cancelled && self.queue_status != QueueStatus::Completed
    }

    pub fn is_pending_remote(&self) -> bool {
        self.confirmed_id().is_none()
    }

    pub fn slot_key(&self) -> Option<SlotKey> {
        SlotKey::new(self.doctor_id.as_deref()?, self.date?, self.time.as_deref()?)
    }

    /// `doctor|patient|date|time`, the fallback identity for unconfirmed records.
    pub fn composite_key(&self) -> Option<String> {
        let slot = self.slot_key()?;
        let patient = self.patient_id.as_deref().map(str::trim).filter(|p| !p.is_empty())?;
        Some(format!("{}|{}|{}|{}", slot.doctor, patient.to_lowercase(), slot.date, slot.time))
    }

    pub fn belongs_to_doctor(&self, doctor_id: &str) -> bool {
        self.doctor_id
            .as_deref()
            .map(|own| own.trim().eq_ignore_ascii_case(doctor_id.trim()))
            .unwrap_or(false)
    }

    pub fn belongs_to_patient(&self, patient_id: &str) -> bool {
        self.patient_id
            .as_deref()
            .map(|own| own.trim().eq_ignore_ascii_case(patient_id.trim()))
            .unwrap_or(false)
    }

    /// Some stable label for logs, even for records without an id.
    pub fn label(&self) -> String {
        self.id
            .clone()
            .or_else(|| self.composite_key())
            .unwrap_or_else(|| "<unidentified>".to_string())
    }

    /// Maps back to the boundary shape; normalizing the result yields `self`.
    pub fn to_raw(&self) -> RawAppointment {
        let instant = |value: &Option<DateTime<Utc>>| value.map(TemporalValue::NativeInstant);
        RawAppointment {
            id: self.id.clone(),
            doctor_id: self.doctor_id.clone(),
            patient_id: self.patient_id.clone(),
            date: self.date.map(|d| TemporalValue::IsoString(d.format("%Y-%m-%d").to_string())),
            time: self.time.clone(),
            appointment_type: Some(self.appointment_type.as_str().to_string()),
            price: self.price,
            payment_status: Some(self.payment_status.as_str().to_string()),
            status: Some(self.status.as_str().to_string()),
            queue_status: Some(self.queue_status.as_str().to_string()),
            booking_time: Some(TemporalValue::NativeInstant(self.booking_time)),
            date_created: instant(&self.date_created),
            started_at: instant(&self.started_at),
            completed_at: instant(&self.completed_at),
            estimated_end_time: instant(&self.estimated_end_time),
            meeting_status: self.meeting_status.map(|m| m.as_str().to_string()),
            meeting_link: self.meeting_link.clone(),
            extra: self.extra.clone(),
        }
    }

    pub fn to_record(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// One bookable unit, compared case- and format-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub doctor: String,
    pub date: NaiveDate,
    pub time: String,
}

impl SlotKey {
    pub fn new(doctor_id: &str, date: NaiveDate, time: &str) -> Option<Self> {
        let doctor = canonical_doctor_id(doctor_id);
        let time = canonical_time_label(time)?;
        if doctor.is_empty() {
            return None;
        }
        Some(Self { doctor, date, time })
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.doctor, self.date, self.time)
    }
}

// ==============================================================================
// BOOKING MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingCandidate {
    pub doctor_id: String,
    pub patient_id: String,
    /// Calendar day in any accepted textual format.
    pub date: String,
    pub time: String,
    #[serde(default = "default_appointment_type")]
    pub appointment_type: AppointmentType,
    #[serde(default)]
    pub price: Option<f64>,
}

fn default_appointment_type() -> AppointmentType {
    AppointmentType::Onsite
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// The remote store holds the record under its confirmed id.
    Confirmed,
    /// Only the local cache holds the record; a pending write will replay it.
    PendingRemote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingReceipt {
    pub appointment_id: String,
    pub sync_state: SyncState,
    pub appointment: Appointment,
}

// ==============================================================================
// PENDING WRITES
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingOperation {
    /// A booking that exists only in the local cache under `local_id`.
    Booking { local_id: String },
    /// A field patch that reached the local cache but not the remote store.
    Patch { appointment_id: String, patch: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PendingStatus {
    LocalOnly,
    RemoteFailed { reason: String },
    /// Replay found the slot taken by another booking; the local copy was cancelled.
    Conflicted { holder: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub id: String,
    pub operation: PendingOperation,
    pub status: PendingStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingWrite {
    pub fn is_unresolved(&self) -> bool {
        !matches!(self.status, PendingStatus::Conflicted { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryReport {
    pub resolved: Vec<String>,
    pub still_pending: Vec<String>,
    pub conflicted: Vec<String>,
}

// ==============================================================================
// QUEUE MODELS
// ==============================================================================

/// Who is looking at the queue; decides which derived stats are filled in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", content = "patientId", rename_all = "snake_case")]
pub enum QueueViewer {
    Provider,
    Patient(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub queue_position: usize,
    pub appointment: Appointment,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total_waiting: usize,
    pub waiting: Vec<QueueEntry>,
    pub in_progress: Option<Appointment>,
    pub completed: Vec<Appointment>,
    pub queue_position: Option<usize>,
    pub patients_ahead: Option<usize>,
    pub estimated_wait_minutes: Option<i64>,
    pub patient_queue_status: Option<QueueStatus>,
}

/// What a queue consumer receives on every recomputation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueUpdate {
    pub doctor_id: String,
    /// The live queue in FCFS order.
    pub appointments: Vec<Appointment>,
    pub stats: QueueStats,
    /// True when the remote plane was unreachable and only local data was used.
    pub degraded: bool,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOutcome {
    pub completed_id: String,
    pub promoted_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub doctor_id: String,
    #[serde(default)]
    pub status: Option<BookingStatus>,
    #[serde(default)]
    pub payment_status: Option<PaymentStatus>,
    pub viewer: QueueViewer,
}

impl SubscriptionRequest {
    /// Confirmed bookings of any payment state: the queue keeps unpaid ones
    /// out itself, but still needs to see a stale in-progress visit.
    pub fn provider(doctor_id: &str) -> Self {
        Self {
            doctor_id: canonical_doctor_id(doctor_id),
            status: Some(BookingStatus::Confirmed),
            payment_status: None,
            viewer: QueueViewer::Provider,
        }
    }

    pub fn patient(doctor_id: &str, patient_id: &str) -> Self {
        Self {
            viewer: QueueViewer::Patient(patient_id.to_string()),
            ..Self::provider(doctor_id)
        }
    }

    /// Key under which the sync controller tracks this subscription.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            canonical_doctor_id(&self.doctor_id),
            self.status.map(|s| s.as_str()).unwrap_or("*"),
            self.payment_status.map(|p| p.as_str()).unwrap_or("*"),
        )
    }
}

// ==============================================================================
// LENIENT FIELD DECODERS
// ==============================================================================

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}
