mod common;

use assert_matches::assert_matches;
use chrono::Duration;

use appointment_queue_cell::error::QueueError;
use appointment_queue_cell::models::QueueStatus;
use shared_models::session::SessionUser;
use common::{opening, paid_appointment, TestClient, DOCTOR};

fn three_waiting(client: &TestClient) {
    client.seed_remote(vec![
        paid_appointment("t3", "p3", 3, "waiting"),
        paid_appointment("t1", "p1", 1, "waiting"),
        paid_appointment("t2", "p2", 2, "waiting"),
    ]);
}

fn in_progress_count(client: &TestClient) -> usize {
    client
        .remote_records()
        .iter()
        .filter(|r| r["queueStatus"] == "in-progress")
        .count()
}

#[tokio::test]
async fn test_start_next_promotes_earliest_booking() {
    let client = TestClient::new();
    three_waiting(&client);
    let controller = client.controller();

    let promoted = controller.start_next_for(DOCTOR).await.unwrap();
    assert_eq!(promoted, "t1");

    let t1 = client.remote_record("t1");
    assert_eq!(t1["queueStatus"], "in-progress");
    assert!(t1["startedAt"].is_string());
    assert!(t1["estimatedEndTime"].is_string());

    let queue = controller.provider_queue(DOCTOR).await;
    assert_eq!(queue.stats.in_progress.as_ref().and_then(|a| a.id.as_deref()), Some("t1"));
    let positions: Vec<(String, usize)> = queue
        .stats
        .waiting
        .iter()
        .map(|e| (e.appointment.id.clone().unwrap(), e.queue_position))
        .collect();
    assert_eq!(positions, vec![("t2".to_string(), 1), ("t3".to_string(), 2)]);
    assert!(!queue.degraded);
}

#[tokio::test]
async fn test_complete_current_promotes_next_in_same_call() {
    let client = TestClient::new();
    three_waiting(&client);
    let controller = client.controller();
    controller.start_next_for(DOCTOR).await.unwrap();

    client.clock.advance(Duration::minutes(40));
    let outcome = controller.complete_current_for(DOCTOR).await.unwrap();

    assert_eq!(outcome.completed_id, "t1");
    assert_eq!(outcome.promoted_id.as_deref(), Some("t2"));

    let t1 = client.remote_record("t1");
    assert_eq!(t1["queueStatus"], "completed");
    assert!(t1["completedAt"].is_string());
    let t2 = client.remote_record("t2");
    assert_eq!(t2["queueStatus"], "in-progress");
    assert!(t2["startedAt"].is_string());
    assert_eq!(in_progress_count(&client), 1);
}

#[tokio::test]
async fn test_patient_behind_one_waiting_and_one_in_progress() {
    let client = TestClient::new();
    client.seed_remote(vec![
        paid_appointment("t1", "p1", 1, "in-progress"),
        paid_appointment("t2", "p2", 2, "waiting"),
        paid_appointment("t3", "p3", 3, "waiting"),
    ]);

    let view = client.controller().patient_position(DOCTOR, "p3").await;

    assert_eq!(view.stats.patients_ahead, Some(1));
    assert_eq!(view.stats.queue_position, Some(2));
    assert_eq!(view.stats.estimated_wait_minutes, Some(2 * 60));
    assert_eq!(view.appointments.len(), 1);

    let next = client.controller().patient_position(DOCTOR, "p2").await;
    assert_eq!(next.stats.queue_position, Some(1));
    assert_eq!(next.stats.estimated_wait_minutes, Some(60));

    let serving = client.controller().patient_position(DOCTOR, "p1").await;
    assert_eq!(serving.stats.patient_queue_status, Some(QueueStatus::InProgress));
    assert_eq!(serving.stats.queue_position, None);
    assert_eq!(serving.stats.estimated_wait_minutes, Some(0));
}

#[tokio::test]
async fn test_at_most_one_in_progress_after_any_sequence() {
    let client = TestClient::new();
    client.seed_remote((1..=5).map(|n| paid_appointment(&format!("t{}", n), &format!("p{}", n), n, "waiting")).collect());
    let controller = client.controller();

    let steps = ["start", "start", "complete", "start", "complete", "complete", "start", "complete", "complete", "complete"];
    for step in steps {
        let _ = match step {
            "start" => controller.start_next_for(DOCTOR).await.map(|_| ()),
            _ => controller.complete_current_for(DOCTOR).await.map(|_| ()),
        };
        assert!(in_progress_count(&client) <= 1, "after {}", step);
    }

    assert_eq!(
        client.remote_records().iter().filter(|r| r["queueStatus"] == "completed").count(),
        5
    );
}

#[tokio::test]
async fn test_queue_positions_follow_booking_time() {
    let client = TestClient::new();
    client.seed_remote(vec![
        paid_appointment("late", "p1", 9, "waiting"),
        paid_appointment("early", "p2", 2, "waiting"),
        paid_appointment("middle", "p3", 5, "waiting"),
    ]);

    let queue = client.controller().provider_queue(DOCTOR).await;
    let position = |id: &str| {
        queue
            .stats
            .waiting
            .iter()
            .find(|e| e.appointment.id.as_deref() == Some(id))
            .map(|e| e.queue_position)
            .unwrap()
    };

    assert!(position("early") < position("middle"));
    assert!(position("middle") < position("late"));
}

#[tokio::test]
async fn test_user_facing_queue_errors() {
    let client = TestClient::new();
    let controller = client.controller();

    assert_matches!(controller.start_next_for(DOCTOR).await, Err(QueueError::QueueEmpty));
    assert_matches!(controller.complete_current_for(DOCTOR).await, Err(QueueError::NoCurrentPatient));

    client.seed_remote(vec![
        paid_appointment("t1", "p1", 1, "in-progress"),
        paid_appointment("t2", "p2", 2, "waiting"),
    ]);
    assert_matches!(
        controller.start_next_for(DOCTOR).await,
        Err(QueueError::PatientInProgress(id)) if id == "t1"
    );
}

#[tokio::test]
async fn test_session_bound_controls_use_signed_in_doctor() {
    let client = TestClient::new();
    three_waiting(&client);
    let controller = client.controller();

    assert_matches!(controller.start_next().await, Err(QueueError::ValidationError(_)));

    client.session.sign_in(SessionUser::doctor(DOCTOR));
    assert_eq!(controller.start_next().await.unwrap(), "t1");
    let outcome = controller.complete_current().await.unwrap();
    assert_eq!(outcome.promoted_id.as_deref(), Some("t2"));
    assert_eq!(controller.my_queue().await.unwrap().stats.total_waiting, 1);
}

#[tokio::test]
async fn test_queue_keeps_working_on_local_data_when_remote_is_down() {
    let client = TestClient::new();
    client.seed_local(vec![
        paid_appointment("t1", "p1", 1, "waiting"),
        paid_appointment("t2", "p2", 2, "waiting"),
    ]);
    client.remote.set_available(false);
    let controller = client.controller();

    assert_eq!(controller.start_next_for(DOCTOR).await.unwrap(), "t1");

    let queue = controller.provider_queue(DOCTOR).await;
    assert!(queue.degraded);
    assert_eq!(queue.stats.in_progress.and_then(|a| a.id), Some("t1".to_string()));

    let pending = client.arbiter().pending_writes().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(client.local_records()[0]["queueStatus"], "in-progress");
}

#[tokio::test]
async fn test_past_and_unpaid_bookings_stay_out_of_live_queue() {
    let client = TestClient::new();
    let mut yesterday = paid_appointment("old", "p1", 1, "waiting");
    yesterday["date"] = "2025-02-28".into();
    let mut unpaid = paid_appointment("unpaid", "p2", 2, "waiting");
    unpaid["paymentStatus"] = "unpaid".into();
    client.seed_remote(vec![yesterday, unpaid, paid_appointment("ok", "p3", 3, "waiting")]);

    let queue = client.controller().provider_queue(DOCTOR).await;
    assert_eq!(queue.stats.total_waiting, 1);
    assert_eq!(queue.appointments[0].id.as_deref(), Some("ok"));
    assert_eq!(queue.computed_at, opening());
}

#[tokio::test]
async fn test_visit_left_open_yesterday_blocks_promotion_until_completed() {
    let client = TestClient::new();
    client.seed_remote(vec![paid_appointment("t1", "p1", 1, "waiting")]);
    let controller = client.controller();
    assert_eq!(controller.start_next_for(DOCTOR).await.unwrap(), "t1");

    client.clock.advance(Duration::days(1));
    let mut next_day = paid_appointment("d2", "p2", 24 * 60 + 5, "waiting");
    next_day["date"] = "2025-03-02".into();
    client.seed_remote(vec![next_day]);

    assert_matches!(
        controller.start_next_for(DOCTOR).await,
        Err(QueueError::PatientInProgress(id)) if id == "t1"
    );
    assert_eq!(in_progress_count(&client), 1);

    let queue = controller.provider_queue(DOCTOR).await;
    assert_eq!(queue.stats.in_progress.and_then(|a| a.id).as_deref(), Some("t1"));

    let outcome = controller.complete_current_for(DOCTOR).await.unwrap();
    assert_eq!(outcome.completed_id, "t1");
    assert_eq!(outcome.promoted_id.as_deref(), Some("d2"));
    assert_eq!(in_progress_count(&client), 1);
}
