// libs/appointment-queue-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json,
    },
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};

use shared_models::error::AppError;

use crate::models::{BookingCandidate, QueueUpdate, SubscriptionRequest};
use crate::router::QueueCellState;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Stream the patient view for this patient instead of the provider view.
    pub patient_id: Option<String>,
}

// ==============================================================================
// BOOKINGS
// ==============================================================================

pub async fn book_appointment(
    State(state): State<Arc<QueueCellState>>,
    Json(candidate): Json<BookingCandidate>,
) -> Result<impl IntoResponse, AppError> {
    info!("Booking request for doctor {} by patient {}", candidate.doctor_id, candidate.patient_id);

    let receipt = state.arbiter.try_book(candidate).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

pub async fn cancel_appointment(
    State(state): State<Arc<QueueCellState>>,
    Path(appointment_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let appointment = state.arbiter.cancel(&appointment_id).await?;
    Ok(Json(appointment))
}

pub async fn pay_appointment(
    State(state): State<Arc<QueueCellState>>,
    Path(appointment_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let appointment = state.arbiter.mark_paid(&appointment_id).await?;
    Ok(Json(appointment))
}

// ==============================================================================
// QUEUE
// ==============================================================================

pub async fn get_provider_queue(
    State(state): State<Arc<QueueCellState>>,
    Path(doctor_id): Path<String>,
) -> Json<QueueUpdate> {
    Json(state.controller.provider_queue(&doctor_id).await)
}

pub async fn get_patient_position(
    State(state): State<Arc<QueueCellState>>,
    Path((doctor_id, patient_id)): Path<(String, String)>,
) -> Json<QueueUpdate> {
    Json(state.controller.patient_position(&doctor_id, &patient_id).await)
}

pub async fn start_next(
    State(state): State<Arc<QueueCellState>>,
    Path(doctor_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let promoted_id = state.controller.start_next_for(&doctor_id).await?;
    Ok(Json(json!({ "promotedId": promoted_id })))
}

pub async fn complete_current(
    State(state): State<Arc<QueueCellState>>,
    Path(doctor_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.controller.complete_current_for(&doctor_id).await?;
    Ok(Json(outcome))
}

/// Server-sent events carrying every `QueueUpdate` for one doctor. The
/// subscription lives as long as the response stream.
pub async fn stream_queue(
    State(state): State<Arc<QueueCellState>>,
    Path(doctor_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let request = match query.patient_id {
        Some(patient_id) => SubscriptionRequest::patient(&doctor_id, &patient_id),
        None => SubscriptionRequest::provider(&doctor_id),
    };
    debug!("Opening queue stream {}", request.key());

    let (tx, rx) = mpsc::unbounded_channel::<QueueUpdate>();
    let handle = state
        .sync
        .subscribe(
            request,
            Arc::new(move |update: QueueUpdate| {
                let _ = tx.send(update);
            }),
        )
        .await;

    let updates = stream::unfold((rx, handle), |(mut rx, handle)| async move {
        let update = rx.recv().await?;
        let event = Event::default().event("queue-update").json_data(&update);
        Some((event, (rx, handle)))
    });

    Sse::new(updates).keep_alive(KeepAlive::default())
}

// ==============================================================================
// PENDING WRITES
// ==============================================================================

pub async fn list_pending_writes(
    State(state): State<Arc<QueueCellState>>,
) -> Result<impl IntoResponse, AppError> {
    let pending = state.arbiter.pending_writes()?;
    Ok(Json(pending))
}

pub async fn retry_pending_writes(
    State(state): State<Arc<QueueCellState>>,
) -> Result<impl IntoResponse, AppError> {
    let report = state.arbiter.retry_pending().await?;
    Ok(Json(report))
}
