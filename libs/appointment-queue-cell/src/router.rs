// libs/appointment-queue-cell/src/router.rs
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use shared_models::session::SessionContext;

use crate::handlers;
use crate::services::{BookingArbiter, DataPlanes, QueueController, SyncController};

/// Services behind the queue routes, all sharing one pair of data planes.
pub struct QueueCellState {
    pub planes: Arc<DataPlanes>,
    pub arbiter: BookingArbiter,
    pub controller: QueueController,
    pub sync: SyncController,
}

impl QueueCellState {
    pub fn new(planes: Arc<DataPlanes>, session: SessionContext) -> Self {
        Self {
            arbiter: BookingArbiter::new(planes.clone()),
            controller: QueueController::new(planes.clone(), session),
            sync: SyncController::new(planes.clone()),
            planes,
        }
    }
}

pub fn create_appointment_queue_router(state: Arc<QueueCellState>) -> Router {
    let booking_routes = Router::new()
        .route("/appointments", post(handlers::book_appointment))
        .route("/appointments/{appointment_id}/cancel", post(handlers::cancel_appointment))
        .route("/appointments/{appointment_id}/pay", post(handlers::pay_appointment));

    let queue_routes = Router::new()
        .route("/doctors/{doctor_id}/queue", get(handlers::get_provider_queue))
        .route(
            "/doctors/{doctor_id}/queue/patients/{patient_id}",
            get(handlers::get_patient_position),
        )
        .route("/doctors/{doctor_id}/queue/start-next", post(handlers::start_next))
        .route("/doctors/{doctor_id}/queue/complete-current", post(handlers::complete_current))
        .route("/doctors/{doctor_id}/queue/stream", get(handlers::stream_queue));

    let sync_routes = Router::new()
        .route("/sync/pending", get(handlers::list_pending_writes))
        .route("/sync/retry", post(handlers::retry_pending_writes));

    Router::new()
        .merge(booking_routes)
        .merge(queue_routes)
        .merge(sync_routes)
        .with_state(state)
}
