//! Job distribution: slot pool, coordinator and per-slot workers.

pub mod coordinator;
pub mod pool;
pub mod worker;

pub use coordinator::{Coordinator, CycleOutcome, PollTiming, effective_capacity};
pub use pool::SlotPool;
pub use worker::SlotWorker;
