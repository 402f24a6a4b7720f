use std::sync::Arc;

use axum::{routing::get, Router};

use appointment_queue_cell::{create_appointment_queue_router, QueueCellState};

pub fn create_router(state: Arc<QueueCellState>) -> Router {
    Router::new()
        .route("/", get(|| async { "Clinic queue API is running!" }))
        .nest("/queue", create_appointment_queue_router(state))
}
