// libs/appointment-queue-cell/src/services/queue.rs
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::{json, Map, Value};
use tracing::warn;

use shared_config::QueueSettings;

use crate::error::QueueError;
use crate::models::{
    Appointment, AppointmentType, BookingStatus, MeetingStatus, PaymentStatus, QueueEntry, QueueStats,
    QueueStatus, QueueViewer,
};

/// A doctor's live queue, split by queue state. Every list is in
/// FCFS order (booking time, then id).
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub doctor_id: String,
    pub today: NaiveDate,
    pub ordered: Vec<Appointment>,
    pub waiting: Vec<Appointment>,
    /// Normally at most one; more only when the stores were edited by hand.
    pub in_progress: Vec<Appointment>,
    pub completed: Vec<Appointment>,
}

impl QueueSnapshot {
    pub fn current(&self) -> Option<&Appointment> {
        self.in_progress.first()
    }
}

/// A validated change to one appointment: the full new state and the field
/// patch that produces it.
#[derive(Debug, Clone)]
pub struct QueueTransition {
    pub appointment: Appointment,
    pub patch: Map<String, Value>,
}

/// FCFS queue rules. Pure: it never touches a store.
#[derive(Debug, Clone)]
pub struct QueueStateMachine {
    slot_minutes: i64,
    meeting_base_url: String,
}

impl QueueStateMachine {
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            slot_minutes: settings.slot_duration_minutes.max(1),
            meeting_base_url: settings.meeting_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn slot_minutes(&self) -> i64 {
        self.slot_minutes
    }

    /// The live queue of `doctor_id`: confirmed, paid, dated today or later.
    /// Undated records are kept so they stay visible to the provider.
    ///
    /// A confirmed visit still in progress is kept whatever its date or
    /// payment state. It stays the current patient until completed, so a
    /// visit left open yesterday blocks promotion today.
    pub fn snapshot(&self, canonical: &[Appointment], doctor_id: &str, today: NaiveDate) -> QueueSnapshot {
        let mut ordered: Vec<Appointment> = canonical
            .iter()
            .filter(|a| a.belongs_to_doctor(doctor_id) && a.status == BookingStatus::Confirmed)
            .filter(|a| {
                a.queue_status == QueueStatus::InProgress
                    || (a.payment_status == PaymentStatus::Paid && a.date.map_or(true, |day| day >= today))
            })
            .cloned()
            .collect();
        ordered.sort_by(fcfs_order);

        let mut snapshot = QueueSnapshot {
            doctor_id: doctor_id.to_string(),
            today,
            ordered: Vec::new(),
            waiting: Vec::new(),
            in_progress: Vec::new(),
            completed: Vec::new(),
        };
        for appointment in &ordered {
            match appointment.queue_status {
                QueueStatus::Waiting => snapshot.waiting.push(appointment.clone()),
                QueueStatus::InProgress => snapshot.in_progress.push(appointment.clone()),
                QueueStatus::Completed => snapshot.completed.push(appointment.clone()),
            }
        }
        if snapshot.in_progress.len() > 1 {
            warn!(
                "Doctor {} has {} appointments in progress; serving the earliest first",
                doctor_id,
                snapshot.in_progress.len()
            );
        }
        snapshot.ordered = ordered;
        snapshot
    }

    pub fn stats(&self, snapshot: &QueueSnapshot, viewer: &QueueViewer) -> QueueStats {
        match viewer {
            QueueViewer::Provider => self.provider_stats(snapshot),
            QueueViewer::Patient(patient_id) => self.patient_stats(snapshot, patient_id),
        }
    }

    pub fn provider_stats(&self, snapshot: &QueueSnapshot) -> QueueStats {
        QueueStats {
            total_waiting: snapshot.waiting.len(),
            waiting: snapshot
                .waiting
                .iter()
                .enumerate()
                .map(|(index, appointment)| QueueEntry {
                    queue_position: index + 1,
                    appointment: appointment.clone(),
                })
                .collect(),
            in_progress: snapshot.current().cloned(),
            completed: snapshot.completed.clone(),
            ..Default::default()
        }
    }

    /// Position and wait estimate for one patient. Other patients' records
    /// are not exposed.
    pub fn patient_stats(&self, snapshot: &QueueSnapshot, patient_id: &str) -> QueueStats {
        let mut stats = QueueStats {
            total_waiting: snapshot.waiting.len(),
            ..Default::default()
        };

        let own = snapshot
            .ordered
            .iter()
            .filter(|a| a.belongs_to_patient(patient_id))
            .find(|a| !a.queue_status.is_terminal())
            .or_else(|| {
                snapshot
                    .ordered
                    .iter()
                    .rev()
                    .find(|a| a.belongs_to_patient(patient_id))
            });
        let Some(own) = own else {
            return stats;
        };

        stats.patient_queue_status = Some(own.queue_status);
        match own.queue_status {
            QueueStatus::Waiting => {
                let ahead = snapshot
                    .waiting
                    .iter()
                    .filter(|a| a.label() != own.label() && a.booking_time < own.booking_time)
                    .count();
                let serving = usize::from(snapshot.current().is_some());
                stats.queue_position = Some(ahead + 1);
                stats.patients_ahead = Some(ahead);
                stats.estimated_wait_minutes = Some((ahead + serving) as i64 * self.slot_minutes);
            }
            QueueStatus::InProgress => {
                stats.patients_ahead = Some(0);
                stats.estimated_wait_minutes = Some(0);
                stats.in_progress = Some(own.clone());
            }
            QueueStatus::Completed => {
                stats.completed = vec![own.clone()];
            }
        }
        stats
    }

    /// Moves `appointment_id` from waiting to in progress. Refused while any
    /// other appointment of the doctor is still being served.
    pub fn promote(
        &self,
        snapshot: &QueueSnapshot,
        appointment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<QueueTransition, QueueError> {
        if let Some(current) = snapshot.current() {
            return Err(QueueError::PatientInProgress(current.label()));
        }
        let target = find(snapshot, appointment_id)?;
        check_transition(target, QueueStatus::InProgress)?;

        let ends_at = now + Duration::minutes(self.slot_minutes);
        let mut updated = target.clone();
        updated.queue_status = QueueStatus::InProgress;
        updated.started_at = Some(now);
        updated.estimated_end_time = Some(ends_at);

        let mut patch = Map::new();
        patch.insert("queueStatus".to_string(), json!(QueueStatus::InProgress.as_str()));
        patch.insert("startedAt".to_string(), json!(now));
        patch.insert("estimatedEndTime".to_string(), json!(ends_at));

        if updated.appointment_type == AppointmentType::Video {
            let link = updated
                .meeting_link
                .clone()
                .unwrap_or_else(|| self.meeting_link(&updated));
            updated.meeting_status = Some(MeetingStatus::Started);
            updated.meeting_link = Some(link.clone());
            patch.insert("meetingStatus".to_string(), json!(MeetingStatus::Started.as_str()));
            patch.insert("meetingLink".to_string(), json!(link));
        }

        Ok(QueueTransition { appointment: updated, patch })
    }

    /// Moves `appointment_id` from in progress to completed.
    pub fn complete(
        &self,
        snapshot: &QueueSnapshot,
        appointment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<QueueTransition, QueueError> {
        let target = find(snapshot, appointment_id)?;
        check_transition(target, QueueStatus::Completed)?;

        let mut updated = target.clone();
        updated.queue_status = QueueStatus::Completed;
        updated.completed_at = Some(now);

        let mut patch = Map::new();
        patch.insert("queueStatus".to_string(), json!(QueueStatus::Completed.as_str()));
        patch.insert("completedAt".to_string(), json!(now));

        Ok(QueueTransition { appointment: updated, patch })
    }

    fn meeting_link(&self, appointment: &Appointment) -> String {
        format!("{}/{}", self.meeting_base_url, appointment.label())
    }
}

fn fcfs_order(a: &Appointment, b: &Appointment) -> std::cmp::Ordering {
    a.booking_time
        .cmp(&b.booking_time)
        .then_with(|| a.label().cmp(&b.label()))
}

fn find<'a>(snapshot: &'a QueueSnapshot, appointment_id: &str) -> Result<&'a Appointment, QueueError> {
    snapshot
        .ordered
        .iter()
        .find(|a| a.label() == appointment_id)
        .ok_or_else(|| QueueError::AppointmentNotFound(appointment_id.to_string()))
}

fn check_transition(appointment: &Appointment, to: QueueStatus) -> Result<(), QueueError> {
    if appointment.queue_status.can_transition_to(&to) {
        Ok(())
    } else {
        Err(QueueError::InvalidStatusTransition {
            from: appointment.queue_status,
            to,
        })
    }
}
