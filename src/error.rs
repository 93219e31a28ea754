//! Error types for the device agent.

use std::time::Duration;

use crate::session::state::Stage;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Playbook error: {0}")]
    Playbook(#[from] PlaybookError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Failures talking to the remote task source or the code service.
///
/// Always retry-eligible: callers back off and try again, nothing here is
/// fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Request to {endpoint} failed: {reason}")]
    Request { endpoint: String, reason: String },

    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },

    #[error("Invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },
}

/// Problems with a fetched task payload.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task is missing required field `{field}`")]
    Malformed { field: &'static str },
}

/// Terminal outcomes of an execution session other than success.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{} within {} seconds", .stage.timeout_message(), .waited.as_secs())]
    StageTimeout { stage: Stage, waited: Duration },

    #[error("Cancelled by user")]
    Cancelled,

    #[error("heartbeat timeout")]
    Stalled,

    #[error("verification not received")]
    VerificationNotReceived,

    #[error("{stage} step failed: {reason}")]
    StepFailed { stage: Stage, reason: String },

    /// Carries the rejected address for logging; the report text is fixed.
    #[error("Invalid emulator_id")]
    InvalidSlot(String),

    #[error("Session task aborted: {0}")]
    Aborted(String),
}

impl SessionError {
    /// Whether this outcome came from the cooperative cancellation path.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Device control errors. Most device calls degrade to empty results
/// instead; these cover the cases where nothing sensible can be returned.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Failed to run {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Device command timed out after {0:?}")]
    Timeout(Duration),
}

/// Playbook loading errors.
#[derive(Debug, thiserror::Error)]
pub enum PlaybookError {
    #[error("Failed to read playbook {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse playbook: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid playbook: {0}")]
    Invalid(String),
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_timeout_message_names_the_stage() {
        let err = SessionError::StageTimeout {
            stage: Stage::AwaitingMainScreen,
            waited: Duration::from_secs(90),
        };
        assert_eq!(err.to_string(), "main screen not reached within 90 seconds");
    }

    #[test]
    fn cancellation_is_distinguished() {
        assert!(SessionError::Cancelled.is_cancellation());
        assert!(!SessionError::VerificationNotReceived.is_cancellation());
        assert_eq!(SessionError::Cancelled.to_string(), "Cancelled by user");
    }

    #[test]
    fn top_level_wraps_transport() {
        let err: Error = TransportError::Status {
            endpoint: "/agent/poll".into(),
            status: 502,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Transport error: /agent/poll returned HTTP 502"
        );
    }
}
