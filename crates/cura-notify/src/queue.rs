//! Cascade event queue.
//!
//! Appointment events are queued and drained by one worker task instead of
//! being fired and forgotten, so callers (and tests) can await completion.
//! One event's failure is logged and counted; the worker keeps draining.

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cascade::RescheduleCascade;
use crate::planner::ConsolidationPlanner;

/// Events the appointment service emits toward this core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppointmentEvent {
    Created {
        appointment_id: i64,
    },
    Rescheduled {
        appointment_id: i64,
        old_date: NaiveDate,
        new_date: NaiveDate,
    },
}

/// Lifetime counters for a cascade worker.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CascadeWorkerStats {
    pub processed: usize,
    pub planned: usize,
    pub cascaded: usize,
    pub failures: usize,
}

/// Producer half: non-blocking enqueue into the worker.
#[derive(Clone)]
pub struct CascadeQueue {
    tx: mpsc::UnboundedSender<AppointmentEvent>,
}

impl CascadeQueue {
    pub fn enqueue(&self, event: AppointmentEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| anyhow!("cascade worker is no longer running"))
    }
}

/// Consumer half: owns the worker task; `shutdown` drains buffered events
/// before joining.
#[derive(Debug)]
pub struct CascadeWorkerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<CascadeWorkerStats>>,
}

impl CascadeWorkerHandle {
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Stops the worker after it drains everything already enqueued and
    /// returns its lifetime stats.
    pub async fn shutdown(&mut self) -> Option<CascadeWorkerStats> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        match self.task.take() {
            Some(task) => task.await.ok(),
            None => None,
        }
    }
}

/// Spawns the cascade worker on the current runtime.
pub fn start_cascade_worker(
    planner: ConsolidationPlanner,
    cascade: RescheduleCascade,
) -> Result<(CascadeQueue, CascadeWorkerHandle)> {
    let handle = tokio::runtime::Handle::try_current()
        .context("cascade worker requires an active Tokio runtime")?;
    let (tx, mut rx) = mpsc::unbounded_channel::<AppointmentEvent>();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let task = handle.spawn(async move {
        let mut stats = CascadeWorkerStats::default();
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => {
                    rx.close();
                    while let Ok(event) = rx.try_recv() {
                        process_event(&planner, &cascade, event, &mut stats).await;
                    }
                    break;
                }
                received = rx.recv() => {
                    match received {
                        Some(event) => process_event(&planner, &cascade, event, &mut stats).await,
                        None => break,
                    }
                }
            }
        }
        info!(
            processed = stats.processed,
            planned = stats.planned,
            cascaded = stats.cascaded,
            failures = stats.failures,
            "cascade worker stopped"
        );
        stats
    });

    Ok((
        CascadeQueue { tx },
        CascadeWorkerHandle {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        },
    ))
}

async fn process_event(
    planner: &ConsolidationPlanner,
    cascade: &RescheduleCascade,
    event: AppointmentEvent,
    stats: &mut CascadeWorkerStats,
) {
    stats.processed += 1;
    match event {
        AppointmentEvent::Created { appointment_id } => {
            match planner.plan_for_appointment(appointment_id, Utc::now()).await {
                Ok(_report) => stats.planned += 1,
                Err(error) => {
                    stats.failures += 1;
                    warn!(appointment_id, %error, "planner event failed");
                }
            }
        }
        AppointmentEvent::Rescheduled {
            appointment_id,
            old_date,
            new_date,
        } => {
            match cascade
                .on_appointment_rescheduled(appointment_id, old_date, new_date, Utc::now())
                .await
            {
                Ok(_report) => stats.cascaded += 1,
                Err(error) => {
                    stats.failures += 1;
                    warn!(appointment_id, %error, "cascade event failed");
                }
            }
        }
    }
}
