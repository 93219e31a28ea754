//! Stage drivers: the device interaction behind each session stage.
//!
//! The session owns waiting, timeouts, cancellation and reporting. A
//! driver only answers "is this stage done yet?" for one poll iteration,
//! performing whatever taps and input that needs.

mod driver;

pub use driver::{Playbook, PlaybookDriver};

use async_trait::async_trait;

use crate::device::DeviceControl;
use crate::jobs::Task;
use crate::session::state::Stage;

/// Result of one poll iteration of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Stage finished; move on.
    Done,
    /// Not yet; poll again after the stage interval.
    Pending,
    /// Stage cannot succeed.
    Failed(String),
}

/// Everything a driver may use for one iteration.
pub struct StepContext<'a> {
    pub device: &'a dyn DeviceControl,
    pub task: &'a Task,
    /// Zero on the first iteration of the stage.
    pub attempt: u32,
    /// Verification code, set only for `AwaitingVerificationCode`.
    pub code: Option<&'a str>,
}

#[async_trait]
pub trait StageDriver: Send + Sync {
    async fn advance(&self, stage: Stage, step: &StepContext<'_>) -> StepOutcome;
}
