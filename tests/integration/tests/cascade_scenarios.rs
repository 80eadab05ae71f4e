//! Reschedule cascade scenarios: detach/repair/replan, past-date guard,
//! orphan cleanup, and claim-lock dedupe under concurrent triggers.

mod common;

use std::sync::Arc;

use common::{appointment, clinic, date, instant, PHONE};
use cura_notify::DetachOutcome;
use cura_store::NotificationStore;

#[tokio::test]
async fn integration_reschedule_detaches_replans_and_notifies_once() {
    // Scenario: A1 and A2 share 2025-06-10; A1 moves to 2025-06-15.
    let clinic = clinic();
    let now = instant(2025, 6, 1, 0);
    clinic.seed(&appointment(1, "BCG", 1, date(2025, 6, 10))).await;
    clinic.seed(&appointment(2, "Polio", 1, date(2025, 6, 10))).await;
    clinic.planner.plan_for_appointment(1, now).await.expect("plan A1");
    clinic.planner.plan_for_appointment(2, now).await.expect("plan A2");

    clinic.seed(&appointment(1, "BCG", 1, date(2025, 6, 15))).await;
    let report = clinic
        .cascade
        .on_appointment_rescheduled(1, date(2025, 6, 10), date(2025, 6, 15), now)
        .await
        .expect("cascade");

    // Old shared messages survive, now mentioning only Polio.
    assert_eq!(report.detached, 2);
    assert_eq!(report.orphans_deleted, 0);
    for expected_at in [instant(2025, 6, 3, 8), instant(2025, 6, 10, 8)] {
        let message = clinic
            .store
            .find_pending_scheduled(PHONE, expected_at)
            .await
            .expect("lookup")
            .expect("old message");
        assert!(!message.body.contains("BCG"));
        assert!(message.body.contains("Polio"));
        assert_eq!(
            clinic
                .store
                .appointment_ids_for_message(message.id)
                .await
                .expect("links"),
            vec![2]
        );
    }

    // New-date messages exist at offsets [7, 0], linked only to A1.
    for expected_at in [instant(2025, 6, 8, 8), instant(2025, 6, 15, 8)] {
        let message = clinic
            .store
            .find_pending_scheduled(PHONE, expected_at)
            .await
            .expect("lookup")
            .expect("new message");
        assert_eq!(
            clinic
                .store
                .appointment_ids_for_message(message.id)
                .await
                .expect("links"),
            vec![1]
        );
    }

    // Exactly one immediate reschedule notification went out.
    assert_eq!(report.immediate.as_deref(), Some("sent"));
    assert_eq!(clinic.gateway.sent_count(), 1);
    let sends = clinic.gateway.sends();
    assert_eq!(sends[0].recipient, PHONE);
    assert!(sends[0].body.contains("BCG"));
}

#[tokio::test]
async fn integration_reschedule_to_past_date_is_flagged_and_silent() {
    // Scenario: A1 moves to a date before "today". Old-date cleanup runs,
    // nothing new is created, no immediate notification fires.
    let clinic = clinic();
    let now = instant(2025, 6, 1, 0);
    clinic.seed(&appointment(1, "BCG", 1, date(2025, 6, 10))).await;
    clinic.planner.plan_for_appointment(1, now).await.expect("plan");
    assert_eq!(clinic.store.live_message_count(), 2);

    clinic.seed(&appointment(1, "BCG", 1, date(2025, 5, 20))).await;
    let report = clinic
        .cascade
        .on_appointment_rescheduled(1, date(2025, 6, 10), date(2025, 5, 20), now)
        .await
        .expect("cascade");

    assert!(report.skipped_past_date);
    assert!(report.plan.is_none());
    assert!(report.immediate.is_none());
    assert_eq!(clinic.store.live_message_count(), 0);
    assert_eq!(clinic.gateway.sent_count(), 0);
}

#[tokio::test]
async fn integration_orphan_cleanup_on_detach() {
    // Detaching the only driver of a pending message deletes it; a shared
    // message survives with one fewer link and a regenerated body.
    let clinic = clinic();
    let now = instant(2025, 6, 1, 0);
    clinic.seed(&appointment(1, "BCG", 1, date(2025, 6, 10))).await;
    clinic.planner.plan_for_appointment(1, now).await.expect("plan");
    let sole = clinic
        .store
        .find_pending_scheduled(PHONE, instant(2025, 6, 3, 8))
        .await
        .expect("lookup")
        .expect("message");

    let registry = cura_notify::LinkRegistry::new(clinic.store.clone());
    let outcome = registry
        .detach_and_maybe_delete(1, sole.id)
        .await
        .expect("detach");
    assert_eq!(outcome, DetachOutcome::Deleted);
    assert!(clinic
        .store
        .message(sole.id)
        .await
        .expect("load")
        .expect("record kept")
        .deleted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn integration_concurrent_cascades_invoke_gateway_at_most_once() {
    // Three doses move together in one user action; three cascades race.
    // The claim lock lets exactly one "you were rescheduled" send through.
    let clinic = clinic();
    let now = instant(2025, 6, 1, 9);
    for (id, item) in [(1_i64, "BCG"), (2, "Polio"), (3, "MMR")] {
        clinic.seed(&appointment(id, item, 1, date(2025, 6, 10))).await;
        clinic.planner.plan_for_appointment(id, now).await.expect("plan");
    }
    for (id, item) in [(1_i64, "BCG"), (2, "Polio"), (3, "MMR")] {
        clinic.seed(&appointment(id, item, 1, date(2025, 6, 15))).await;
    }

    let cascade = Arc::new(clinic.cascade.clone());
    let mut tasks = Vec::new();
    for id in [1_i64, 2, 3] {
        let cascade = cascade.clone();
        tasks.push(tokio::spawn(async move {
            cascade
                .on_appointment_rescheduled(id, date(2025, 6, 10), date(2025, 6, 15), now)
                .await
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("cascade");
    }

    assert_eq!(clinic.gateway.sent_count(), 1);

    // Replanning any group member afterwards converges the message set:
    // every appointment ends up linked to a reminder at both offsets.
    clinic.planner.plan_for_appointment(1, now).await.expect("replan");
    for expected_at in [instant(2025, 6, 8, 8), instant(2025, 6, 15, 8)] {
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
