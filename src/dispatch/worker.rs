//! Slot worker: the long-lived loop bound to one slot.
//!
//! Each iteration advertises the slot idle, waits briefly for a job, and
//! withdraws the token again whether or not one arrived. A job is run to a
//! terminal outcome before the next iteration, so a slot never holds two.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pool::SlotPool;
use crate::device::DeviceControl;
use crate::error::SessionError;
use crate::jobs::{JobPayload, ReportStatus, Slot, StatusReport, Task, TaskQueue};
use crate::session::{ExecutionSession, SessionDeps, SessionOutcome};

pub struct SlotWorker {
    slot: Slot,
    device: Arc<dyn DeviceControl>,
    pool: Arc<SlotPool>,
    queue: Arc<TaskQueue>,
    deps: SessionDeps,
    /// Bound on each wait for a job, so shutdown is noticed promptly.
    claim_wait: Duration,
}

impl SlotWorker {
    pub fn new(
        slot: Slot,
        device: Arc<dyn DeviceControl>,
        pool: Arc<SlotPool>,
        queue: Arc<TaskQueue>,
        deps: SessionDeps,
        claim_wait: Duration,
    ) -> Self {
        Self {
            slot,
            device,
            pool,
            queue,
            deps,
            claim_wait,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, shutdown: CancellationToken) {
        info!(slot = %self.slot.id, "Slot worker started");
        let mut deliveries: Vec<JoinHandle<()>> = Vec::new();

        while !shutdown.is_cancelled() {
            self.pool.advertise_idle(&self.slot.id);
            let ready = tokio::select! {
                _ = shutdown.cancelled() => false,
                ready = self.queue.wait_for_job(self.claim_wait) => ready,
            };
            // Busy or not, this iteration's token goes back. A job is taken
            // in the same step, so capacity reads never count both.
            let job = self
                .pool
                .withdraw_with(&self.slot.id, || if ready { self.queue.take() } else { None });

            let Some(job) = job else {
                continue;
            };
            if let Some(pending) = self.process(job).await {
                deliveries.push(pending);
            }
            self.queue.task_done();
            deliveries.retain(|d| !d.is_finished());
        }

        self.pool.try_withdraw(&self.slot.id);
        if !deliveries.is_empty() {
            debug!(slot = %self.slot.id, pending = deliveries.len(), "Waiting for status deliveries");
            join_all(deliveries).await;
        }
        info!(slot = %self.slot.id, "Slot worker stopped");
    }

    /// Run one job to a terminal outcome. Returns the session's pending
    /// status deliveries.
    async fn process(&self, job: JobPayload) -> Option<JoinHandle<()>> {
        let task = match Task::try_from(job) {
            Ok(task) => task,
            Err(e) => {
                warn!(slot = %self.slot.id, error = %e, "Dropping malformed job");
                return None;
            }
        };
        let phone = task.phone.clone();

        let session = ExecutionSession::new(task, self.slot.clone(), Arc::clone(&self.device), self.deps.clone());
        let session_id = session.session_id();
        match tokio::spawn(session.run()).await {
            Ok(result) => {
                match &result.outcome {
                    SessionOutcome::Completed { codes } => {
                        info!(slot = %self.slot.id, phone = %phone, %session_id, codes = codes.len(), elapsed_secs = result.elapsed.as_secs(), "Task completed")
                    }
                    SessionOutcome::Failed { error } => {
                        info!(slot = %self.slot.id, phone = %phone, %session_id, stage = %result.stage, error = %error, "Task failed")
                    }
                    SessionOutcome::Cancelled => {
                        info!(slot = %self.slot.id, phone = %phone, %session_id, "Task cancelled")
                    }
                }
                Some(result.deliveries)
            }
            Err(e) => {
                error!(slot = %self.slot.id, phone = %phone, %session_id, error = %e, "Session task aborted");
                self.deps.heartbeats.end(&self.slot.id);
                self.deps.cancellations.remove(session_id);

                let sink = self.deps.reporter.session_sink();
                sink.emit(
                    StatusReport::new(&phone, ReportStatus::Failed)
                        .with_emulator(&self.slot.id)
                        .with_error(SessionError::Aborted(e.to_string()).to_string()),
                );
                Some(sink.close())
            }
        }
    }
}
