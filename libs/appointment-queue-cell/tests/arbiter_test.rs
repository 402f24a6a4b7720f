mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use serde_json::json;

use appointment_queue_cell::error::QueueError;
use appointment_queue_cell::models::{
    AppointmentType, BookingStatus, MeetingStatus, PaymentStatus, PendingOperation, PendingStatus, QueueStatus,
    SyncState,
};
use common::{candidate, opening, TestClient, DAY, DOCTOR};

#[tokio::test]
async fn test_second_booking_for_same_slot_is_rejected() {
    let client = TestClient::new();
    let arbiter = client.arbiter();

    let receipt = arbiter.try_book(candidate("p1", "09:00")).await.unwrap();
    assert_eq!(receipt.sync_state, SyncState::Confirmed);
    assert!(!receipt.appointment_id.starts_with("local-"));

    let second = arbiter.try_book(candidate("p2", "09:00")).await;
    assert_matches!(second, Err(QueueError::SlotTaken(_)));

    // Same slot written differently is still the same slot.
    let third = arbiter.try_book(candidate("p3", "9:00 am")).await;
    assert_matches!(third, Err(QueueError::SlotTaken(_)));
}

#[tokio::test]
async fn test_serialized_bookings_accept_exactly_one() {
    let client = TestClient::new();
    let arbiter = client.arbiter();

    let mut accepted = 0;
    let mut rejected = 0;
    for patient in ["p1", "p2", "p3", "p4", "p5"] {
        match arbiter.try_book(candidate(patient, "14:30")).await {
            Ok(_) => accepted += 1,
            Err(QueueError::SlotTaken(_)) => rejected += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(accepted, 1);
    assert_eq!(rejected, 4);
    assert_eq!(client.remote_records().len(), 1);
}

#[tokio::test]
async fn test_booking_creates_waiting_unpaid_record_in_both_planes() {
    let client = TestClient::new();
    let receipt = client.arbiter().try_book(candidate("p1", "10:00")).await.unwrap();

    let appointment = &receipt.appointment;
    assert_eq!(appointment.status, BookingStatus::Confirmed);
    assert_eq!(appointment.queue_status, QueueStatus::Waiting);
    assert_eq!(appointment.payment_status, PaymentStatus::Unpaid);
    assert_eq!(appointment.booking_time, common::opening());

    let remote = client.remote_record(&receipt.appointment_id);
    assert_eq!(remote["doctorId"], DOCTOR);
    assert_eq!(remote["queueStatus"], "waiting");

    let local = client.local_records();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0]["id"], receipt.appointment_id.as_str());
    assert!(client.arbiter().pending_writes().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancelled_booking_frees_the_slot() {
    let client = TestClient::new();
    let arbiter = client.arbiter();

    let first = arbiter.try_book(candidate("p1", "09:00")).await.unwrap();
    let cancelled = arbiter.cancel(&first.appointment_id).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(client.remote_record(&first.appointment_id)["status"], "cancelled");

    let rebooked = arbiter.try_book(candidate("p2", "09:00")).await;
    tokio_test::assert_ok!(rebooked);

    assert_matches!(
        arbiter.cancel(&first.appointment_id).await,
        Err(QueueError::InvalidBookingChange(..))
    );
}

#[tokio::test]
async fn test_remote_outage_keeps_booking_locally_and_retry_confirms_it() {
    let client = TestClient::new();
    let arbiter = client.arbiter();
    client.remote.set_available(false);

    let receipt = arbiter.try_book(candidate("p1", "11:00")).await.unwrap();
    assert_eq!(receipt.sync_state, SyncState::PendingRemote);
    assert!(receipt.appointment_id.starts_with("local-"));

    let pending = arbiter.pending_writes().unwrap();
    assert_eq!(pending.len(), 1);
    assert_matches!(&pending[0].operation, PendingOperation::Booking { local_id } if *local_id == receipt.appointment_id);
    assert_matches!(pending[0].status, PendingStatus::RemoteFailed { .. });

    // The local copy alone is enough to block the slot while offline.
    assert_matches!(
        arbiter.try_book(candidate("p2", "11:00")).await,
        Err(QueueError::SlotTaken(_))
    );

    let still_down = arbiter.retry_pending().await.unwrap();
    assert_eq!(still_down.still_pending.len(), 1);

    client.remote.set_available(true);
    let report = arbiter.retry_pending().await.unwrap();
    assert_eq!(report.resolved.len(), 1);
    assert!(arbiter.pending_writes().unwrap().is_empty());

    let remote = client.remote_records();
    assert_eq!(remote.len(), 1);
    let confirmed_id = remote[0]["id"].as_str().unwrap().to_string();
    let local = client.local_records();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0]["id"], confirmed_id.as_str());
}

#[tokio::test]
async fn test_replay_is_cancelled_when_slot_was_taken_meanwhile() {
    let offline = TestClient::new();
    let online = offline.other_device();

    offline.remote.set_available(false);
    let pending = offline.arbiter().try_book(candidate("p1", "12:00")).await.unwrap();
    assert_eq!(pending.sync_state, SyncState::PendingRemote);
    offline.remote.set_available(true);

    let winner = online.arbiter().try_book(candidate("p2", "12:00")).await.unwrap();

    let report = offline.arbiter().retry_pending().await.unwrap();
    assert_eq!(report.conflicted.len(), 1);

    let writes = offline.arbiter().pending_writes().unwrap();
    assert_matches!(
        &writes[0].status,
        PendingStatus::Conflicted { holder: Some(holder) } if *holder == winner.appointment_id
    );
    assert_eq!(offline.local_records()[0]["status"], "cancelled");
    assert_eq!(offline.remote_records().len(), 1);
}

#[tokio::test]
async fn test_patch_made_offline_is_replayed() {
    let client = TestClient::new();
    let arbiter = client.arbiter();
    let receipt = arbiter.try_book(candidate("p1", "13:00")).await.unwrap();

    client.remote.set_available(false);
    let paid = arbiter.mark_paid(&receipt.appointment_id).await.unwrap();
    assert_eq!(paid.payment_status, PaymentStatus::Paid);
    assert_eq!(client.remote_record(&receipt.appointment_id)["paymentStatus"], "unpaid");

    client.remote.set_available(true);
    let report = arbiter.retry_pending().await.unwrap();
    assert_eq!(report.resolved.len(), 1);
    assert_eq!(client.remote_record(&receipt.appointment_id)["paymentStatus"], "paid");
}

#[tokio::test]
async fn test_invalid_candidates_are_rejected() {
    let client = TestClient::new();
    let arbiter = client.arbiter();

    let mut past = candidate("p1", "09:00");
    past.date = "2025-02-28".to_string();
    assert_matches!(arbiter.try_book(past).await, Err(QueueError::ValidationError(_)));

    let mut no_patient = candidate("", "09:00");
    no_patient.patient_id = "   ".to_string();
    assert_matches!(arbiter.try_book(no_patient).await, Err(QueueError::ValidationError(_)));

    assert_matches!(arbiter.try_book(candidate("p1", " ")).await, Err(QueueError::ValidationError(_)));

    let mut garbled = candidate("p1", "09:00");
    garbled.date = "someday".to_string();
    assert_matches!(arbiter.try_book(garbled).await, Err(QueueError::ValidationError(_)));

    assert!(client.remote_records().is_empty());
}

#[tokio::test]
async fn test_video_booking_waits_for_meeting() {
    let client = TestClient::new();
    let mut video = candidate("p1", "15:00");
    video.appointment_type = AppointmentType::Video;

    let receipt = client.arbiter().try_book(video).await.unwrap();
    assert_eq!(receipt.appointment.meeting_status, Some(MeetingStatus::Waiting));
    assert_eq!(client.remote_record(&receipt.appointment_id)["meetingStatus"], "waiting");
}

#[tokio::test]
async fn test_existing_remote_booking_in_legacy_shape_blocks_slot() {
    let client = TestClient::new();
    client.seed_remote(vec![json!({
        "id": "legacy-1",
        "doctorId": DOCTOR,
        "patientId": "p0",
        "date": { "seconds": 1740826800, "nanoseconds": 0 },
        "time": "4:00 PM",
        "status": "Confirmed"
    })]);

    assert_matches!(
        client.arbiter().try_book(candidate("p1", "16:00")).await,
        Err(QueueError::SlotTaken(_))
    );
}

#[tokio::test]
async fn test_doctor_id_casing_does_not_open_a_second_claim() {
    let first_device = TestClient::new();
    let second_device = first_device.other_device();

    let first = first_device.arbiter().try_book(candidate("p1", "09:00")).await.unwrap();

    let mut shouted = candidate("p2", "09:00");
    shouted.doctor_id = " DR@X.com".to_string();
    assert_matches!(
        second_device.arbiter().try_book(shouted).await,
        Err(QueueError::SlotTaken(_))
    );
    assert_eq!(first_device.remote_records().len(), 1);

    let mut other_slot = candidate("p2", "10:00");
    other_slot.doctor_id = "Dr@X.Com".to_string();
    let receipt = second_device.arbiter().try_book(other_slot).await.unwrap();
    assert_eq!(first_device.remote_record(&receipt.appointment_id)["doctorId"], DOCTOR);

    first_device.arbiter().mark_paid(&first.appointment_id).await.unwrap();
    second_device.arbiter().mark_paid(&receipt.appointment_id).await.unwrap();
    let queue = first_device.controller().provider_queue("DR@X.COM").await;
    assert_eq!(queue.stats.total_waiting, 2);
}

#[tokio::test]
async fn test_pending_booking_without_slot_does_not_block_later_replays() {
    let client = TestClient::new();
    client.seed_local(vec![json!({
        "id": "local-broken",
        "doctorId": DOCTOR,
        "patientId": "p9",
        "date": DAY,
    })]);
    let broken = client.planes.pending.register_booking("local-broken", opening()).unwrap();

    client.remote.set_available(false);
    let offline = client.arbiter().try_book(candidate("p1", "11:00")).await.unwrap();
    assert_eq!(offline.sync_state, SyncState::PendingRemote);
    client.remote.set_available(true);

    let report = client.arbiter().retry_pending().await.unwrap();
    assert_eq!(report.conflicted, vec![broken.clone()]);
    assert_eq!(report.resolved.len(), 1);
    assert_eq!(client.remote_records().len(), 1);

    // Given up on, so later runs skip it.
    let again = client.arbiter().retry_pending().await.unwrap();
    assert!(again.conflicted.is_empty() && again.resolved.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_offline_bookings_are_all_kept() {
    let client = TestClient::new();
    client.remote.set_available(false);
    let arbiter = Arc::new(client.arbiter());

    let tasks: Vec<_> = (0..100)
        .map(|n| {
            let arbiter = arbiter.clone();
            tokio::spawn(async move {
                let mut booking = candidate(&format!("p{}", n), "09:00");
                booking.doctor_id = format!("dr{}@x.com", n);
                arbiter.try_book(booking).await
            })
        })
        .collect();
    for task in tasks {
        let receipt = task.await.unwrap().unwrap();
        assert_eq!(receipt.sync_state, SyncState::PendingRemote);
    }

    assert_eq!(client.local_records().len(), 100);
    assert_eq!(arbiter.pending_writes().unwrap().len(), 100);

    client.remote.set_available(true);
    let report = arbiter.retry_pending().await.unwrap();
    assert_eq!(report.resolved.len(), 100);
    assert_eq!(client.remote_records().len(), 100);
    assert!(client
        .local_records()
        .iter()
        .all(|r| !r["id"].as_str().unwrap().starts_with("local-")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bookings_for_one_slot_accept_one() {
    let client = TestClient::new();
    let arbiter = Arc::new(client.arbiter());

    let tasks: Vec<_> = (0..20)
        .map(|n| {
            let arbiter = arbiter.clone();
            tokio::spawn(async move { arbiter.try_book(candidate(&format!("p{}", n), "17:00")).await })
        })
        .collect();
    let mut accepted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(e) => assert_matches!(e, QueueError::SlotTaken(_)),
        }
    }

    assert_eq!(accepted, 1);
    assert_eq!(client.remote_records().len(), 1);
}
