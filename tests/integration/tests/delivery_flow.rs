//! End-to-end flow: plan against the sqlite store, then deliver the due
//! messages through the scheduler, exercising the same conditional-update
//! contract both store backends implement.

mod common;

use std::sync::Arc;

use chrono::Utc;
use common::{date, instant, policy, PHONE, SUBJECT_ID};
use cura_core::config::DeliveryConfig;
use cura_delivery::{DeliveryScheduler, DryRunGateway};
use cura_notify::{ConsolidationPlanner, TemplateCatalog};
use cura_store::{
    AppointmentRecord, MessageStatus, NotificationStore, RecipientProfile, RecipientRelationship,
    SqliteStore,
};

fn delivery_config() -> DeliveryConfig {
    DeliveryConfig {
        poll_interval_secs: 60,
        batch_size: 10,
        retry_attempts: 2,
        retry_backoff_base_ms: 1,
        max_delivery_attempts: 5,
        stale_claim_after_secs: None,
    }
}

async fn sqlite_clinic() -> (Arc<SqliteStore>, ConsolidationPlanner) {
    let store = Arc::new(SqliteStore::open_ephemeral().expect("open store"));
    store
        .upsert_profile(&RecipientProfile {
            subject_id: SUBJECT_ID,
            display_name: "Alya".to_string(),
            phone: Some(PHONE.to_string()),
            relationship: RecipientRelationship::Mother,
            opted_out: false,
        })
        .await
        .expect("profile");
    let planner = ConsolidationPlanner::new(
        store.clone(),
        store.clone(),
        policy(),
        TemplateCatalog::new(),
    );
    (store, planner)
}

#[tokio::test]
async fn integration_planned_messages_deliver_once_due() {
    let (store, planner) = sqlite_clinic().await;
    store
        .upsert_appointment(&AppointmentRecord {
            id: 1,
            subject_id: SUBJECT_ID,
            item_name: "BCG".to_string(),
            sequence: 1,
            scheduled_date: Some(date(2025, 6, 10)),
            deleted: false,
        })
        .await
        .expect("appointment");

    let plan_now = instant(2025, 6, 1, 0);
    planner.plan_for_appointment(1, plan_now).await.expect("plan");

    let gateway = Arc::new(DryRunGateway::new());
    let scheduler = DeliveryScheduler::new(
        store.clone(),
        store.clone(),
        gateway.clone(),
        delivery_config(),
    );

    // Before the first run_at nothing is due.
    let early = scheduler.run_cycle(instant(2025, 6, 2, 0)).await.expect("early cycle");
    assert_eq!(early.due, 0);

    // After the 7-day offset instant, exactly that reminder goes out.
    let report = scheduler.run_cycle(instant(2025, 6, 3, 9)).await.expect("due cycle");
    assert_eq!(report.due, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(gateway.sent_count(), 1);
    assert_eq!(gateway.sends()[0].recipient, PHONE);

    // A repeated cycle does not double-deliver.
    let repeat = scheduler.run_cycle(instant(2025, 6, 3, 10)).await.expect("repeat cycle");
    assert_eq!(repeat.due, 0);
    assert_eq!(gateway.sent_count(), 1);

    // The same-day reminder becomes due on June 10.
    let final_cycle = scheduler.run_cycle(instant(2025, 6, 10, 9)).await.expect("final cycle");
    assert_eq!(final_cycle.sent, 1);
    assert_eq!(gateway.sent_count(), 2);
}

#[tokio::test]
async fn integration_sent_messages_are_immutable_and_stamped() {
    let (store, planner) = sqlite_clinic().await;
    store
        .upsert_appointment(&AppointmentRecord {
            id: 1,
            subject_id: SUBJECT_ID,
            item_name: "BCG".to_string(),
            sequence: 1,
            scheduled_date: Some(date(2025, 6, 10)),
            deleted: false,
        })
        .await
        .expect("appointment");
    planner
        .plan_for_appointment(1, instant(2025, 6, 1, 0))
        .await
        .expect("plan");

    let gateway = Arc::new(DryRunGateway::new());
    let scheduler = DeliveryScheduler::new(
        store.clone(),
        store.clone(),
        gateway,
        delivery_config(),
    );
    scheduler
        .run_cycle(instant(2025, 6, 10, 9))
        .await
        .expect("cycle");

    let due_before = store
        .due_scheduled_messages(instant(2025, 6, 10, 9), 10)
        .await
        .expect("due");
    assert!(due_before.is_empty());

    // Both messages were delivered; each carries a sent_at stamp and no
    // error, and body updates are now rejected.
    for id in [1_i64, 2] {
        let message = store.message(id).await.expect("load").expect("present");
        assert_eq!(message.status, MessageStatus::Sent);
        assert!(message.sent_at.is_some());
        assert!(message.error.is_none());
        assert!(store.update_body(id, "tampered").await.is_err());
    }
}

#[tokio::test]
async fn integration_memory_and_sqlite_agree_on_claim_contract() {
    // The conditional transition behaves identically on both backends:
    // exactly one winner, repeat claims fail, terminal states stay put.
    use cura_store::MemoryStore;

    let memory: Arc<dyn NotificationStore> = Arc::new(MemoryStore::new());
    let sqlite: Arc<dyn NotificationStore> =
        Arc::new(SqliteStore::open_ephemeral().expect("open"));

    for store in [memory, sqlite] {
        let message = store
            .insert_message(cura_store::NewMessage {
                recipient: PHONE.to_string(),
                body: "body".to_string(),
                kind: cura_store::MessageKind::Scheduled,
                status: MessageStatus::Pending,
                scheduled_at: Utc::now(),
                template: cura_store::TemplateKey::Reminder { offset_days: 7 },
            })
            .await
            .expect("insert");

        assert!(store
            .try_transition_status(message.id, MessageStatus::Pending, MessageStatus::Sending)
            .await
            .expect("claim"));
        assert!(!store
            .try_transition_status(message.id, MessageStatus::Pending, MessageStatus::Sending)
            .await
            .expect("lost claim"));
        store.mark_sent(message.id, Utc::now()).await.expect("sent");
        assert!(!store
            .try_transition_status(message.id, MessageStatus::Sending, MessageStatus::Pending)
            .await
            .expect("sent is terminal"));
    }
}
