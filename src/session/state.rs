//! Execution session state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::{Slot, Task};

/// Stage of an execution session. Stages advance strictly in declaration
/// order; `Failed` and `Cancelled` are reachable from any active stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Starting,
    Preparing,
    EnteringNumber,
    AwaitingConfirmation,
    SelectingVerificationMethod,
    AwaitingVerificationCode,
    EnteringProfile,
    AwaitingMainScreen,
    MonitoringForSecondaryCode,
    Completed,
    Failed,
    Cancelled,
}

impl Stage {
    /// The stage that follows this one on the success path.
    pub fn next(&self) -> Option<Stage> {
        use Stage::*;
        match self {
            Starting => Some(Preparing),
            Preparing => Some(EnteringNumber),
            EnteringNumber => Some(AwaitingConfirmation),
            AwaitingConfirmation => Some(SelectingVerificationMethod),
            SelectingVerificationMethod => Some(AwaitingVerificationCode),
            AwaitingVerificationCode => Some(EnteringProfile),
            EnteringProfile => Some(AwaitingMainScreen),
            AwaitingMainScreen => Some(MonitoringForSecondaryCode),
            MonitoringForSecondaryCode => Some(Completed),
            Completed | Failed | Cancelled => None,
        }
    }

    pub fn can_transition_to(&self, target: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(target, Stage::Failed | Stage::Cancelled) || self.next() == Some(target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Stages whose timeout is logged and skipped rather than fatal.
    pub fn is_optional(&self) -> bool {
        matches!(
            self,
            Self::AwaitingConfirmation | Self::SelectingVerificationMethod
        )
    }

    /// Failure text used when this stage's wait runs out.
    pub fn timeout_message(&self) -> &'static str {
        match self {
            Self::Starting => "session did not start",
            Self::Preparing => "device preparation did not finish",
            Self::EnteringNumber => "input fields not found",
            Self::AwaitingConfirmation => "confirmation dialog not shown",
            Self::SelectingVerificationMethod => "verification method not offered",
            Self::AwaitingVerificationCode => "verification code not entered",
            Self::EnteringProfile => "profile screen did not appear",
            Self::AwaitingMainScreen => "main screen not reached",
            Self::MonitoringForSecondaryCode => "secondary code not detected",
            Self::Completed | Self::Failed | Self::Cancelled => "session already finished",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Preparing => "preparing",
            Self::EnteringNumber => "entering_number",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::SelectingVerificationMethod => "selecting_verification_method",
            Self::AwaitingVerificationCode => "awaiting_verification_code",
            Self::EnteringProfile => "entering_profile",
            Self::AwaitingMainScreen => "awaiting_main_screen",
            Self::MonitoringForSecondaryCode => "monitoring_for_secondary_code",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A recorded stage change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: Stage,
    pub to: Stage,
    pub timestamp: DateTime<Utc>,
}

/// State of one running session. Owned and mutated only by the worker
/// running it.
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub session_id: Uuid,
    pub task: Task,
    pub slot: Slot,
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StageTransition>,
}

impl SessionState {
    pub fn new(task: Task, slot: Slot) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            task,
            slot,
            stage: Stage::Starting,
            started_at: now,
            last_heartbeat_at: now,
            finished_at: None,
            transitions: Vec::new(),
        }
    }

    /// Move to `target`, recording the transition.
    pub fn transition_to(&mut self, target: Stage) -> Result<(), String> {
        if !self.stage.can_transition_to(target) {
            return Err(format!("Cannot transition from {} to {}", self.stage, target));
        }
        self.transitions.push(StageTransition {
            from: self.stage,
            to: target,
            timestamp: Utc::now(),
        });
        self.stage = target;
        if target.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Advance to the next success-path stage.
    pub fn advance(&mut self) -> Result<Stage, String> {
        let next = self
            .stage
            .next()
            .ok_or_else(|| format!("No stage after {}", self.stage))?;
        self.transition_to(next)?;
        Ok(next)
    }

    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SessionState {
        SessionState::new(
            Task {
                phone: "+1555".into(),
                attributes: Default::default(),
            },
            Slot::from_address("127.0.0.1:21503"),
        )
    }

    #[test]
    fn success_path_visits_every_stage_in_order() {
        let mut state = state();
        let mut visited = vec![state.stage];
        while let Ok(stage) = state.advance() {
            visited.push(stage);
        }
        assert_eq!(
            visited,
            vec![
                Stage::Starting,
                Stage::Preparing,
                Stage::EnteringNumber,
                Stage::AwaitingConfirmation,
                Stage::SelectingVerificationMethod,
                Stage::AwaitingVerificationCode,
                Stage::EnteringProfile,
                Stage::AwaitingMainScreen,
                Stage::MonitoringForSecondaryCode,
                Stage::Completed,
            ]
        );
        assert!(state.finished_at.is_some());
        assert_eq!(state.transitions.len(), 9);
    }

    #[test]
    fn failure_reachable_from_any_active_stage() {
        let mut stage = Stage::Starting;
        while let Some(next) = stage.next() {
            assert!(stage.can_transition_to(Stage::Failed));
            assert!(stage.can_transition_to(Stage::Cancelled));
            stage = next;
        }
    }

    #[test]
    fn no_skipping_or_leaving_terminal() {
        assert!(!Stage::Preparing.can_transition_to(Stage::AwaitingMainScreen));
        assert!(!Stage::EnteringNumber.can_transition_to(Stage::Preparing));
        assert!(!Stage::Failed.can_transition_to(Stage::Starting));
        assert!(!Stage::Completed.can_transition_to(Stage::Failed));
        assert!(!Stage::Cancelled.can_transition_to(Stage::Failed));

        let mut state = state();
        state.transition_to(Stage::Failed).unwrap();
        assert!(state.transition_to(Stage::Preparing).is_err());
    }

    #[test]
    fn optional_stages() {
        assert!(Stage::AwaitingConfirmation.is_optional());
        assert!(Stage::SelectingVerificationMethod.is_optional());
        assert!(!Stage::EnteringNumber.is_optional());
        assert!(!Stage::AwaitingMainScreen.is_optional());
    }

    #[test]
    fn stage_serde_names() {
        let json = serde_json::to_string(&Stage::MonitoringForSecondaryCode).unwrap();
        assert_eq!(json, "\"monitoring_for_secondary_code\"");
        assert_eq!(Stage::AwaitingMainScreen.to_string(), "awaiting_main_screen");
    }
}
