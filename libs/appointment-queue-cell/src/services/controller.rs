// libs/appointment-queue-cell/src/services/controller.rs
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use shared_models::session::SessionContext;

use crate::error::QueueError;
use crate::models::{Appointment, CompletionOutcome, QueueUpdate, QueueViewer};
use crate::services::planes::{AppointmentQuery, DataPlanes};
use crate::services::queue::{QueueSnapshot, QueueStateMachine, QueueTransition};

/// Drives the queue state machine against both data planes on behalf of a
/// doctor, either named explicitly or taken from the signed-in session.
pub struct QueueController {
    planes: Arc<DataPlanes>,
    machine: QueueStateMachine,
    session: SessionContext,
}

impl QueueController {
    pub fn new(planes: Arc<DataPlanes>, session: SessionContext) -> Self {
        let machine = QueueStateMachine::new(&planes.settings);
        Self {
            planes,
            machine,
            session,
        }
    }

    pub async fn start_next(&self) -> Result<String, QueueError> {
        let doctor_id = self.session_doctor()?;
        self.start_next_for(&doctor_id).await
    }

    /// Promotes the earliest waiting patient. Returns the promoted id.
    #[instrument(skip(self))]
    pub async fn start_next_for(&self, doctor_id: &str) -> Result<String, QueueError> {
        let (snapshot, _) = self.load_snapshot(doctor_id).await;

        if let Some(current) = snapshot.current() {
            return Err(QueueError::PatientInProgress(current.label()));
        }
        let next = snapshot.waiting.first().ok_or(QueueError::QueueEmpty)?;
        let next_id = next.label();

        let transition = self.machine.promote(&snapshot, &next_id, self.planes.now())?;
        self.apply(transition).await?;

        info!("Doctor {} started {}", doctor_id, next_id);
        Ok(next_id)
    }

    pub async fn complete_current(&self) -> Result<CompletionOutcome, QueueError> {
        let doctor_id = self.session_doctor()?;
        self.complete_current_for(&doctor_id).await
    }

    /// Completes the current patient, then promotes the next one against the
    /// post-completion queue.
    #[instrument(skip(self))]
    pub async fn complete_current_for(&self, doctor_id: &str) -> Result<CompletionOutcome, QueueError> {
        let (snapshot, canonical) = self.load_snapshot(doctor_id).await;

        let current = snapshot.current().ok_or(QueueError::NoCurrentPatient)?;
        let completed_id = current.label();

        let transition = self.machine.complete(&snapshot, &completed_id, self.planes.now())?;
        let completed = self.apply(transition).await?;

        let after: Vec<Appointment> = canonical
            .into_iter()
            .map(|a| if a.label() == completed_id { completed.clone() } else { a })
            .collect();
        let next_snapshot = self.machine.snapshot(&after, doctor_id, self.planes.today());

        let promoted_id = match next_snapshot.waiting.first().map(Appointment::label) {
            Some(next_id) => match self.machine.promote(&next_snapshot, &next_id, self.planes.now()) {
                Ok(transition) => {
                    self.apply(transition).await?;
                    Some(next_id)
                }
                Err(QueueError::PatientInProgress(other)) => {
                    warn!("Not promoting {}: {} is still in progress", next_id, other);
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        info!(
            "Doctor {} completed {}; next: {}",
            doctor_id,
            completed_id,
            promoted_id.as_deref().unwrap_or("none")
        );
        Ok(CompletionOutcome {
            completed_id,
            promoted_id,
        })
    }

    pub async fn provider_queue(&self, doctor_id: &str) -> QueueUpdate {
        self.queue_update(doctor_id, &QueueViewer::Provider).await
    }

    pub async fn patient_position(&self, doctor_id: &str, patient_id: &str) -> QueueUpdate {
        self.queue_update(doctor_id, &QueueViewer::Patient(patient_id.to_string()))
            .await
    }

    /// The signed-in doctor's own queue.
    pub async fn my_queue(&self) -> Result<QueueUpdate, QueueError> {
        let doctor_id = self.session_doctor()?;
        Ok(self.provider_queue(&doctor_id).await)
    }

    pub async fn queue_update(&self, doctor_id: &str, viewer: &QueueViewer) -> QueueUpdate {
        let query = AppointmentQuery::queue_candidates(doctor_id);
        let load = self.planes.load(&query).await;
        let snapshot = self.machine.snapshot(&load.appointments, doctor_id, self.planes.today());
        build_update(&self.machine, &snapshot, viewer, load.degraded, self.planes.now())
    }

    async fn load_snapshot(&self, doctor_id: &str) -> (QueueSnapshot, Vec<Appointment>) {
        let load = self.planes.load(&AppointmentQuery::queue_candidates(doctor_id)).await;
        if load.degraded {
            warn!("Queue for {} computed from local data only", doctor_id);
        }
        let snapshot = self.machine.snapshot(&load.appointments, doctor_id, self.planes.today());
        (snapshot, load.appointments)
    }

    async fn apply(&self, transition: QueueTransition) -> Result<Appointment, QueueError> {
        self.planes
            .persist_patch(&transition.appointment, transition.patch)
            .await?;
        Ok(transition.appointment)
    }

    fn session_doctor(&self) -> Result<String, QueueError> {
        self.session
            .doctor_id()
            .ok_or_else(|| QueueError::ValidationError("no doctor is signed in".to_string()))
    }
}

/// Shapes a snapshot into what consumers receive. Patients only see their
/// own appointments.
pub(crate) fn build_update(
    machine: &QueueStateMachine,
    snapshot: &QueueSnapshot,
    viewer: &QueueViewer,
    degraded: bool,
    now: DateTime<Utc>,
) -> QueueUpdate {
    let appointments = match viewer {
        QueueViewer::Provider => snapshot.ordered.clone(),
        QueueViewer::Patient(patient_id) => snapshot
            .ordered
            .iter()
            .filter(|a| a.belongs_to_patient(patient_id))
            .cloned()
            .collect(),
    };

    QueueUpdate {
        doctor_id: snapshot.doctor_id.clone(),
        appointments,
        stats: machine.stats(snapshot, viewer),
        degraded,
        computed_at: now,
    }
}
