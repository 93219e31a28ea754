//! Task queue: ordered holding area between fetch and claim.
//!
//! Every push adds exactly one semaphore permit and every successful pop
//! consumes one, so a job is handed to exactly one worker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::debug;

use super::model::JobPayload;

pub struct TaskQueue {
    jobs: Mutex<VecDeque<JobPayload>>,
    available: Semaphore,
    /// Pushed but not yet acknowledged with `task_done`.
    unfinished: AtomicUsize,
}

impl TaskQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(VecDeque::new()),
            available: Semaphore::new(0),
            unfinished: AtomicUsize::new(0),
        })
    }

    /// Append a job at the tail.
    pub fn push(&self, job: JobPayload) {
        self.lock().push_back(job);
        self.unfinished.fetch_add(1, Ordering::SeqCst);
        self.available.add_permits(1);
    }

    /// Wait at most `wait` for a job and reserve it. After `true`, the
    /// caller's next `take` finds a job.
    pub async fn wait_for_job(&self, wait: Duration) -> bool {
        match tokio::time::timeout(wait, self.available.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                true
            }
            _ => false,
        }
    }

    /// Take the head job. Only call after a successful `wait_for_job`.
    pub fn take(&self) -> Option<JobPayload> {
        let job = self.lock().pop_front();
        if job.is_none() {
            debug!("Queue permit acquired with no job present");
        }
        job
    }

    /// Jobs fetched but not yet claimed by a worker.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Jobs pushed and not yet acknowledged (queued plus in flight).
    pub fn unfinished(&self) -> usize {
        self.unfinished.load(Ordering::SeqCst)
    }

    /// Acknowledge that a claimed job reached a terminal outcome.
    pub fn task_done(&self) {
        let _ = self
            .unfinished
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<JobPayload>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}
