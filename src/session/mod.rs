//! Execution sessions and the machinery around them.

pub mod cancel;
pub mod classify;
pub mod heartbeat;
pub mod runner;
pub mod state;

pub use cancel::{CancelHandle, CancelReason, CancellationRegistry};
pub use classify::FailureClassifier;
pub use heartbeat::{HeartbeatBoard, SlotLiveness, spawn_heartbeat_monitor};
pub use runner::{ExecutionSession, SessionDeps, SessionOutcome, SessionResult, SessionSettings};
pub use state::{SessionState, Stage};
