//! Outbound delivery: the SMS gateway seam and the polling scheduler that
//! claims, sends, and retries due messages.

pub mod gateway;
pub mod scheduler;

pub use gateway::{DryRunGateway, DryRunSend, GatewayError, GatewayReceipt, HttpSmsGateway, SmsGateway};
pub use scheduler::{
    start_delivery_scheduler, DeliveryCycleReport, DeliveryScheduler, DeliverySchedulerHandle,
};
