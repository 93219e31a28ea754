//! Jobs: wire/data model and the local task queue.

pub mod model;
pub mod queue;

pub use model::{ControlSignal, JobPayload, PollResponse, ReportStatus, Slot, StatusReport, Task};
pub use queue::TaskQueue;
