// libs/appointment-queue-cell/src/services/normalizer.rs
//
// The single boundary where heterogeneous store records become `Appointment`s.
// Nothing past this module sees a `TemporalValue` or a free-form status string.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::{
    Appointment, AppointmentType, BookingStatus, MeetingStatus, PaymentStatus, QueueStatus,
    RawAppointment, TemporalValue,
};

/// Epoch values at or above this are taken to be milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%d.%m.%Y",
    "%a %b %d %Y",
    "%b %d %Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%d %b %Y",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

const TIME_FORMATS: &[&str] = &[
    "%I:%M %p",
    "%I:%M%p",
    "%I:%M:%S %p",
    "%I %p",
    "%H:%M",
    "%H:%M:%S",
];

/// Fills every field downstream logic relies on. Never fails; `raw` is left
/// untouched.
pub fn normalize(raw: &RawAppointment, now: DateTime<Utc>) -> Appointment {
    let date_created = raw.date_created.as_ref().and_then(to_instant);

    let booking_time = match raw.booking_time.as_ref().and_then(to_instant) {
        Some(instant) => instant,
        None => match date_created {
            Some(created) => created,
            None => {
                debug!(
                    "Appointment {} has no booking time or creation date; treating it as newly discovered",
                    raw.id.as_deref().unwrap_or("<no id>")
                );
                now
            }
        },
    };

    let queue_status = match raw.queue_status.as_deref() {
        None => QueueStatus::Waiting,
        Some(value) => QueueStatus::parse_lenient(value).unwrap_or_else(|| {
            debug!("Unknown queue status '{}', defaulting to waiting", value);
            QueueStatus::Waiting
        }),
    };

    Appointment {
        id: non_empty(&raw.id),
        doctor_id: non_empty(&raw.doctor_id),
        patient_id: non_empty(&raw.patient_id),
        date: raw.date.as_ref().and_then(to_calendar_date),
        time: non_empty(&raw.time),
        appointment_type: raw
            .appointment_type
            .as_deref()
            .and_then(AppointmentType::parse_lenient)
            .unwrap_or(AppointmentType::Onsite),
        price: raw.price,
        payment_status: raw
            .payment_status
            .as_deref()
            .and_then(PaymentStatus::parse_lenient)
            .unwrap_or(PaymentStatus::Unpaid),
        status: raw
            .status
            .as_deref()
            .and_then(BookingStatus::parse_lenient)
            .unwrap_or(BookingStatus::Confirmed),
        queue_status,
        booking_time,
        date_created,
        started_at: raw.started_at.as_ref().and_then(to_instant),
        completed_at: raw.completed_at.as_ref().and_then(to_instant),
        estimated_end_time: raw.estimated_end_time.as_ref().and_then(to_instant),
        meeting_status: raw.meeting_status.as_deref().and_then(MeetingStatus::parse_lenient),
        meeting_link: non_empty(&raw.meeting_link),
        extra: raw.extra.clone(),
    }
}

/// Decodes store JSON into raw records. Values that cannot be read as an
/// appointment at all are logged and dropped.
pub fn decode_records(values: &[Value]) -> Vec<RawAppointment> {
    values
        .iter()
        .filter_map(|value| match serde_json::from_value::<RawAppointment>(value.clone()) {
            Ok(raw) => Some(raw),
            Err(e) => {
                warn!("Dropping malformed appointment record: {} ({})", e, truncate(value));
                None
            }
        })
        .collect()
}

pub fn to_instant(value: &TemporalValue) -> Option<DateTime<Utc>> {
    match value {
        TemporalValue::EpochSeconds(n) => from_epoch(*n),
        TemporalValue::ServerTimestamp(ts) => DateTime::from_timestamp(ts.seconds, ts.nanoseconds),
        TemporalValue::NativeInstant(instant) => Some(*instant),
        TemporalValue::IsoString(text) => parse_instant(text),
    }
}

pub fn to_calendar_date(value: &TemporalValue) -> Option<NaiveDate> {
    match value {
        // Written text keeps its own calendar day, whatever the offset.
        TemporalValue::IsoString(text) => parse_calendar_date(text),
        other => to_instant(other).map(|instant| instant.date_naive()),
    }
}

fn from_epoch(n: i64) -> Option<DateTime<Utc>> {
    if n.abs() >= EPOCH_MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(n)
    } else {
        DateTime::from_timestamp(n, 0)
    }
}

fn parse_instant(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(instant) = DateTime::parse_from_rfc3339(text) {
        return Some(instant.with_timezone(&Utc));
    }
    if let Ok(instant) = DateTime::parse_from_rfc2822(text) {
        return Some(instant.with_timezone(&Utc));
    }
    if let Ok(n) = text.parse::<i64>() {
        return from_epoch(n);
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    parse_calendar_date(text).and_then(|date| date.and_hms_opt(0, 0, 0)).map(|naive| naive.and_utc())
}

/// Reads a calendar day from any accepted textual format, ignoring an
/// embedded time component.
pub fn parse_calendar_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(date);
        }
    }

    // ISO text with a time part: "2025-03-01T09:00:00Z", "2025-03-01 09:00".
    if let Some(prefix) = text.get(..10) {
        if let Ok(date) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
            return Some(date);
        }
    }

    // Date::toString() style: "Sat Mar 01 2025 09:00:00 GMT+0000 (...)".
    if let Some(prefix) = text.get(..15) {
        if let Ok(date) = NaiveDate::parse_from_str(prefix, "%a %b %d %Y") {
            return Some(date);
        }
    }

    if let Ok(instant) = DateTime::parse_from_rfc2822(text) {
        return Some(instant.date_naive());
    }

    text.parse::<i64>().ok().and_then(from_epoch).map(|instant| instant.date_naive())
}

/// Canonical form of a slot label: `HH:MM` when it parses as a time of day,
/// otherwise the lower-cased label with collapsed whitespace.
pub fn canonical_time_label(label: &str) -> Option<String> {
    let collapsed = label.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }

    let upper = collapsed.to_uppercase();
    for format in TIME_FORMATS {
        if let Ok(time) = NaiveTime::parse_from_str(&upper, format) {
            return Some(time.format("%H:%M").to_string());
        }
    }

    Some(collapsed.to_lowercase())
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn truncate(value: &Value) -> String {
    let mut text = value.to_string();
    if text.len() > 200 {
        let mut cut = 200;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...");
    }
    text
}
