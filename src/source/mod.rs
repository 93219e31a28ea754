//! Remote task source: where jobs come from and where status goes.

mod http;

pub use http::HttpTaskSource;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::jobs::{ControlSignal, JobPayload, StatusReport};

/// The remote side of the agent. Every error is retry-eligible.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Ask for up to `capacity` jobs.
    async fn poll(&self, capacity: usize) -> Result<Vec<JobPayload>, TransportError>;

    /// Deliver one status report (single attempt).
    async fn post_status(&self, report: &StatusReport) -> Result<(), TransportError>;

    /// Read the per-task control flags.
    async fn control(&self, phone: &str) -> Result<ControlSignal, TransportError>;
}
