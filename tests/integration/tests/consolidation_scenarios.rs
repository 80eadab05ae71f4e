//! Consolidation planner scenarios: single appointments, day groups,
//! idempotence, and the no-past-creation guarantee.

mod common;

use common::{appointment, clinic, date, instant, PHONE};
use cura_store::{MessageStatus, NotificationStore};

#[tokio::test]
async fn integration_single_appointment_gets_one_message_per_offset() {
    // Appointment dated 2025-06-10, offsets [7, 0], now = 2025-06-01:
    // exactly two pending messages, at June 3 and June 10, 08:00 local.
    let clinic = clinic();
    let now = instant(2025, 6, 1, 0);
    clinic.seed(&appointment(1, "BCG", 1, date(2025, 6, 10))).await;

    let report = clinic
        .planner
        .plan_for_appointment(1, now)
        .await
        .expect("plan");
    assert_eq!(report.created, 2);
    assert_eq!(clinic.store.live_message_count(), 2);

    for (offset, expected_at) in [(7_u32, instant(2025, 6, 3, 8)), (0, instant(2025, 6, 10, 8))] {
        let message = clinic
            .store
            .find_pending_scheduled(PHONE, expected_at)
            .await
            .expect("lookup")
            .unwrap_or_else(|| panic!("missing message for offset {offset}"));
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.scheduled_at, expected_at);
        assert_eq!(
            clinic
                .store
                .appointment_ids_for_message(message.id)
                .await
                .expect("links"),
            vec![1],
            "offset {offset} message should link only to A1"
        );
    }
}

#[tokio::test]
async fn integration_same_day_appointment_joins_existing_messages() {
    // A second appointment on the same date attaches to the two existing
    // messages instead of creating new ones, and the bodies mention both.
    let clinic = clinic();
    let now = instant(2025, 6, 1, 0);
    clinic.seed(&appointment(1, "BCG", 1, date(2025, 6, 10))).await;
    clinic.seed(&appointment(2, "Polio", 1, date(2025, 6, 10))).await;

    clinic.planner.plan_for_appointment(1, now).await.expect("plan A1");
    let report = clinic
        .planner
        .plan_for_appointment(2, now)
        .await
        .expect("plan A2");

    assert_eq!(report.created, 0);
    assert_eq!(report.reused, 2);
    assert_eq!(clinic.store.live_message_count(), 2);

    for expected_at in [instant(2025, 6, 3, 8), instant(2025, 6, 10, 8)] {
        let message = clinic
            .store
            .find_pending_scheduled(PHONE, expected_at)
            .await
            .expect("lookup")
            .expect("message");
        let mut linked = clinic
            .store
            .appointment_ids_for_message(message.id)
            .await
            .expect("links");
        linked.sort_unstable();
        assert_eq!(linked, vec![1, 2]);
        assert!(message.body.contains("BCG"));
        assert!(message.body.contains("Polio"));
    }
}

#[tokio::test]
async fn integration_planner_is_idempotent_for_every_group_member() {
    let clinic = clinic();
    let now = instant(2025, 6, 1, 0);
    clinic.seed(&appointment(1, "BCG", 1, date(2025, 6, 10))).await;
    clinic.seed(&appointment(2, "Polio", 1, date(2025, 6, 10))).await;

    for _ in 0..3 {
        for id in [1_i64, 2] {
            clinic.planner.plan_for_appointment(id, now).await.expect("plan");
        }
    }

    // Message and link counts are stable no matter how often or in which
    // order the group is replanned.
    assert_eq!(clinic.store.live_message_count(), 2);
    assert_eq!(clinic.store.link_count(), 4);
}

#[tokio::test]
async fn integration_grouping_invariant_one_message_per_offset() {
    // Three appointments, one subject, one date: after planning all of
    // them there is exactly one pending message per offset, covering the
    // full appointment set.
    let clinic = clinic();
    let now = instant(2025, 6, 1, 0);
    for (id, item) in [(1_i64, "BCG"), (2, "Polio"), (3, "MMR")] {
        clinic.seed(&appointment(id, item, 1, date(2025, 6, 10))).await;
        clinic.planner.plan_for_appointment(id, now).await.expect("plan");
    }

    assert_eq!(clinic.store.live_message_count(), 2);
    for expected_at in [instant(2025, 6, 3, 8), instant(2025, 6, 10, 8)] {
        let message = clinic
            .store
            .find_pending_scheduled(PHONE, expected_at)
            .await
            .expect("lookup")
            .expect("message");
        let mut linked = clinic
            .store
            .appointment_ids_for_message(message.id)
            .await
            .expect("links");
        linked.sort_unstable();
        assert_eq!(linked, vec![1, 2, 3]);
    }
}

#[tokio::test]
async fn integration_no_message_is_created_for_past_offsets() {
    // now = 2025-06-08: the 7-day offset (June 3) is gone, only the
    // same-day reminder is created.
    let clinic = clinic();
    let now = instant(2025, 6, 8, 0);
    clinic.seed(&appointment(1, "BCG", 1, date(2025, 6, 10))).await;

    let report = clinic
        .planner
        .plan_for_appointment(1, now)
        .await
        .expect("plan");
    assert_eq!(report.created, 1);
    assert_eq!(report.offsets_skipped_past, 1);
    assert!(clinic
        .store
        .find_pending_scheduled(PHONE, instant(2025, 6, 3, 8))
        .await
        .expect("lookup")
        .is_none());
    assert!(clinic
        .store
        .find_pending_scheduled(PHONE, instant(2025, 6, 10, 8))
        .await
        .expect("lookup")
        .is_some());
}

#[tokio::test]
async fn integration_all_offsets_past_creates_nothing() {
    let clinic = clinic();
    let now = instant(2025, 6, 11, 0);
    clinic.seed(&appointment(1, "BCG", 1, date(2025, 6, 10))).await;

    let report = clinic
        .planner
        .plan_for_appointment(1, now)
        .await
        .expect("plan");
    assert_eq!(report.created, 0);
    assert_eq!(report.offsets_skipped_past, 2);
    assert_eq!(clinic.store.live_message_count(), 0);
}
