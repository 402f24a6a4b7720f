use thiserror::Error;

use shared_models::error::AppError;

use crate::models::QueueStatus;

/// Failure reported by a remote store implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Record {0} not found in remote store")]
    NotFound(String),

    #[error("Remote store rejected the request: {0}")]
    Rejected(String),
}

/// Failure reported by the local durable cache.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Local cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Local cache entry '{key}' is corrupt: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Local cache lock poisoned")]
    Poisoned,

    #[error("Local cache update of '{0}' did not run")]
    UpdateSkipped(String),
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Slot {0} is already taken")]
    SlotTaken(String),

    #[error("No patients are waiting in the queue")]
    QueueEmpty,

    #[error("No patient is currently being served")]
    NoCurrentPatient,

    #[error("Appointment {0} is already in progress; complete it before starting the next one")]
    PatientInProgress(String),

    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(#[from] StoreError),

    #[error("Malformed appointment record: {0}")]
    MalformedRecord(String),

    #[error("Invalid queue status transition from {from} to {to}")]
    InvalidStatusTransition { from: QueueStatus, to: QueueStatus },

    #[error("Appointment {0} cannot be changed: {1}")]
    InvalidBookingChange(String, String),

    #[error("Appointment not found: {0}")]
    AppointmentNotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Local cache error: {0}")]
    LocalCache(#[from] CacheError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl QueueError {
    /// Machine-readable reason shown to clients.
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::SlotTaken(_) => "SLOT_TAKEN",
            QueueError::QueueEmpty => "QUEUE_EMPTY",
            QueueError::NoCurrentPatient => "NO_CURRENT_PATIENT",
            QueueError::PatientInProgress(_) => "PATIENT_IN_PROGRESS",
            QueueError::RemoteUnavailable(_) => "REMOTE_UNAVAILABLE",
            QueueError::MalformedRecord(_) => "MALFORMED_RECORD",
            QueueError::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            QueueError::InvalidBookingChange(..) => "INVALID_BOOKING_CHANGE",
            QueueError::AppointmentNotFound(_) => "NOT_FOUND",
            QueueError::ValidationError(_) => "VALIDATION_ERROR",
            QueueError::LocalCache(_) => "LOCAL_CACHE",
            QueueError::SerializationError(_) => "SERIALIZATION",
        }
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::SlotTaken(_)
            | QueueError::QueueEmpty
            | QueueError::NoCurrentPatient
            | QueueError::PatientInProgress(_)
            | QueueError::InvalidStatusTransition { .. }
            | QueueError::InvalidBookingChange(..) => AppError::conflict(err.code(), err.to_string()),
            QueueError::AppointmentNotFound(_) => AppError::NotFound(err.to_string()),
            QueueError::ValidationError(msg) => AppError::ValidationError(msg),
            QueueError::MalformedRecord(msg) => AppError::BadRequest(msg),
            QueueError::RemoteUnavailable(_)
            | QueueError::LocalCache(_)
            | QueueError::SerializationError(_) => AppError::Internal(err.to_string()),
        }
    }
}
