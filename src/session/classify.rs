//! Outer-boundary failure tagging for `failed` reports.
//!
//! Best effort: anything not recognised is reported with its raw text.

use crate::error::SessionError;

/// Error text reported for an app-level rejection.
pub const BLOCKED: &str = "blocked";

#[derive(Debug, Clone)]
pub struct FailureClassifier {
    blocked_patterns: Vec<String>,
}

impl FailureClassifier {
    pub fn new(blocked_patterns: &[String]) -> Self {
        Self {
            blocked_patterns: blocked_patterns
                .iter()
                .map(|p| p.to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Error text for the `failed` report.
    pub fn classify(&self, err: &SessionError) -> String {
        if err.is_cancellation() {
            return err.to_string();
        }
        let raw = err.to_string();
        let lower = raw.to_lowercase();
        if self.blocked_patterns.iter().any(|p| lower.contains(p)) {
            return BLOCKED.to_string();
        }
        raw
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::session::state::Stage;

    fn classifier() -> FailureClassifier {
        FailureClassifier::new(&["not allowed to use".to_string(), "banned".to_string()])
    }

    #[test]
    fn cancellation_tag() {
        assert_eq!(classifier().classify(&SessionError::Cancelled), "Cancelled by user");
    }

    #[test]
    fn rejection_tag() {
        let err = SessionError::StepFailed {
            stage: Stage::EnteringNumber,
            reason: "This number is BANNED from the service".into(),
        };
        assert_eq!(classifier().classify(&err), BLOCKED);
    }

    #[test]
    fn raw_text_otherwise() {
        let err = SessionError::StageTimeout {
            stage: Stage::EnteringNumber,
            waited: Duration::from_secs(15),
        };
        assert_eq!(classifier().classify(&err), "input fields not found within 15 seconds");
        assert_eq!(
            classifier().classify(&SessionError::VerificationNotReceived),
            "verification not received"
        );
    }
}
