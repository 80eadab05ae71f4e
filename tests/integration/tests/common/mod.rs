#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};

use cura_core::time_utils::ReminderPolicy;
use cura_delivery::DryRunGateway;
use cura_notify::{ConsolidationPlanner, RescheduleCascade, TemplateCatalog};
use cura_store::{
    AppointmentRecord, MemoryStore, NotificationStore, RecipientProfile, RecipientRelationship,
};

pub const SUBJECT_ID: i64 = 9;
pub const PHONE: &str = "+628123456789";

pub fn policy() -> ReminderPolicy {
    ReminderPolicy::new(
        vec![7, 0],
        NaiveTime::from_hms_opt(8, 0, 0).expect("send time"),
        "UTC".parse().expect("timezone"),
    )
    .expect("policy")
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("date")
}

pub fn instant(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
        .single()
        .expect("instant")
}

pub fn appointment(id: i64, item: &str, sequence: u32, scheduled: NaiveDate) -> AppointmentRecord {
    AppointmentRecord {
        id,
        subject_id: SUBJECT_ID,
        item_name: item.to_string(),
        sequence,
        scheduled_date: Some(scheduled),
        deleted: false,
    }
}

pub struct Clinic {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<DryRunGateway>,
    pub planner: ConsolidationPlanner,
    pub cascade: RescheduleCascade,
}

pub fn clinic() -> Clinic {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(DryRunGateway::new());
    store.upsert_profile(RecipientProfile {
        subject_id: SUBJECT_ID,
        display_name: "Alya".to_string(),
        phone: Some(PHONE.to_string()),
        relationship: RecipientRelationship::Mother,
        opted_out: false,
    });
    let planner = ConsolidationPlanner::new(
        store.clone(),
        store.clone(),
        policy(),
        TemplateCatalog::new(),
    );
    let cascade = RescheduleCascade::new(
        planner.clone(),
        gateway.clone(),
        chrono::Duration::seconds(300),
    );
    Clinic {
        store,
        gateway,
        planner,
        cascade,
    }
}

impl Clinic {
    pub async fn seed(&self, record: &AppointmentRecord) {
        self.store.upsert_appointment(record).await.expect("seed appointment");
    }
}
