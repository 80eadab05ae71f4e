//! Notification consolidation and reschedule cascade engine.
//!
//! Collapses a subject's same-day appointments into one reminder message
//! per policy offset, keeps those messages consistent as appointments move,
//! and dedupes immediate reschedule alerts through a store-backed claim
//! lock. Delivery itself lives in `cura-delivery`.

pub mod cascade;
pub mod claim;
pub mod links;
pub mod planner;
pub mod queue;
pub mod template;

pub use cascade::{CascadeReport, RescheduleCascade};
pub use claim::{ImmediateNotifier, SendOnceOutcome};
pub use links::{DetachOutcome, LinkRegistry};
pub use planner::{
    ConsolidationPlanner, PlanReport, SKIP_REASON_NOT_PLANNABLE, SKIP_REASON_NO_RECIPIENT,
    SKIP_REASON_OPTED_OUT,
};
pub use queue::{
    start_cascade_worker, AppointmentEvent, CascadeQueue, CascadeWorkerHandle, CascadeWorkerStats,
};
pub use template::{
    greeting_for_hour, render, TemplateCatalog, TemplateVars, GREETING_DAY, GREETING_EVENING,
};
