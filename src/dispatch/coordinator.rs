//! Distribution coordinator: pulls work sized to actual free capacity.
//!
//! Capacity is idle slots minus jobs already queued but unclaimed, capped
//! at the slot count. The remote source is never polled when that is zero.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pool::SlotPool;
use crate::config::AgentConfig;
use crate::jobs::TaskQueue;
use crate::source::TaskSource;

/// Sleeps between cycles.
#[derive(Debug, Clone, Copy)]
pub struct PollTiming {
    /// After an idle cycle (no capacity or nothing offered).
    pub interval: Duration,
    /// After a transport failure.
    pub backoff: Duration,
    /// After enqueueing jobs.
    pub settle: Duration,
}

impl PollTiming {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            interval: config.poll_interval,
            backoff: config.poll_backoff,
            settle: config.settle_delay,
        }
    }
}

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No idle slots.
    NoCapacity,
    /// Idle slots are all covered by jobs already queued.
    Saturated { pending: usize },
    /// The source had nothing to offer.
    Empty,
    Enqueued(usize),
    TransportError,
}

impl CycleOutcome {
    pub fn pause(&self, timing: &PollTiming) -> Duration {
        match self {
            Self::Enqueued(_) => timing.settle,
            Self::TransportError => timing.backoff,
            Self::NoCapacity | Self::Saturated { .. } | Self::Empty => timing.interval,
        }
    }
}

/// Slots eligible for new work right now.
pub fn effective_capacity(free: usize, pending: usize, total: usize) -> usize {
    free.saturating_sub(pending).min(total)
}

pub struct Coordinator {
    source: Arc<dyn TaskSource>,
    pool: Arc<SlotPool>,
    queue: Arc<TaskQueue>,
    total_slots: usize,
    timing: PollTiming,
}

impl Coordinator {
    pub fn new(
        source: Arc<dyn TaskSource>,
        pool: Arc<SlotPool>,
        queue: Arc<TaskQueue>,
        total_slots: usize,
        timing: PollTiming,
    ) -> Self {
        Self {
            source,
            pool,
            queue,
            total_slots,
            timing,
        }
    }

    /// One poll: size the request, fetch, enqueue in arrival order.
    pub async fn poll_cycle(&self) -> CycleOutcome {
        // Skip the queue lock when nothing is idle.
        if self.pool.free_count() == 0 {
            return CycleOutcome::NoCapacity;
        }
        // Workers claim under the pool lock, so this pair is one snapshot.
        let (free, pending) = self.pool.free_count_with(|| self.queue.pending());
        if free == 0 {
            return CycleOutcome::NoCapacity;
        }
        let capacity = effective_capacity(free, pending, self.total_slots);
        if capacity == 0 {
            debug!(free, pending, "Queued jobs cover all idle slots");
            return CycleOutcome::Saturated { pending };
        }

        let jobs = match self.source.poll(capacity).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, capacity, "Polling task source failed");
                return CycleOutcome::TransportError;
            }
        };
        if jobs.is_empty() {
            return CycleOutcome::Empty;
        }
        if jobs.len() > capacity {
            warn!(requested = capacity, received = jobs.len(), "Task source returned more jobs than requested");
        }

        let count = jobs.len();
        for job in jobs {
            self.queue.push(job);
        }
        info!(count, capacity, free, "Jobs enqueued");
        CycleOutcome::Enqueued(count)
    }

    /// Run poll cycles until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                slots = self.total_slots,
                interval_ms = self.timing.interval.as_millis() as u64,
                "Coordinator started"
            );
            while !shutdown.is_cancelled() {
                let outcome = self.poll_cycle().await;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(outcome.pause(&self.timing)) => {}
                }
            }
            info!("Coordinator stopped");
        })
    }
}
