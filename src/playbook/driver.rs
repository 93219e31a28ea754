//! Data-driven stage driver.
//!
//! A [`Playbook`] names the selectors and commands for each stage. It is
//! loaded from JSON so the agent carries no application-specific UI
//! knowledge of its own.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{StageDriver, StepContext, StepOutcome};
use crate::device::{KEYCODE_DEL, KEYCODE_ENTER, Point, Selector, find_in_snapshot};
use crate::error::PlaybookError;
use crate::session::state::Stage;

/// Timeout for each preparation command.
const PREPARE_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-stage selectors and commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Playbook {
    /// Shell commands run once at the start of preparation.
    pub prepare_commands: Vec<String>,
    /// Pause after the preparation commands.
    pub settle_ms: u64,
    /// Tapped when present during preparation.
    pub accept: Vec<Selector>,
    /// Blind tap when no `accept` element shows up in time.
    pub accept_fallback_tap: Option<Point>,
    /// Preparation iterations before falling back.
    pub accept_attempts: u32,
    pub prefix_field: Option<Selector>,
    pub number_field: Selector,
    /// Dialing prefix typed into `prefix_field`; the task's
    /// `dialing_prefix` attribute overrides it.
    pub dialing_prefix: Option<String>,
    /// Backspaces sent before typing the prefix.
    pub clear_keystrokes: u32,
    pub submit: Vec<Selector>,
    pub confirm: Vec<Selector>,
    /// Elements that mean the application refused the number.
    pub rejection: Vec<Selector>,
    /// Entry to the alternate verification methods.
    pub alternate_method: Vec<Selector>,
    pub method: Vec<Selector>,
    pub method_continue: Vec<Selector>,
    pub profile_field: Vec<Selector>,
    /// Typed into the profile field; the task's `profile_name` attribute
    /// overrides it.
    pub profile_name: String,
    pub profile_submit: Vec<Selector>,
    pub main_screen: Vec<Selector>,
    /// Dialogs that may be dismissed while waiting.
    pub dismiss: Vec<Selector>,
}

impl Playbook {
    pub async fn from_file(path: &Path) -> Result<Self, PlaybookError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| PlaybookError::Read {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, PlaybookError> {
        let playbook: Self = serde_json::from_str(raw)?;
        playbook.validate()?;
        Ok(playbook)
    }

    fn validate(&self) -> Result<(), PlaybookError> {
        if self.number_field == Selector::default() {
            return Err(PlaybookError::Invalid("number_field must be set".into()));
        }
        if self.main_screen.is_empty() {
            return Err(PlaybookError::Invalid("main_screen needs at least one selector".into()));
        }
        if self.profile_field.is_empty() {
            return Err(PlaybookError::Invalid("profile_field needs at least one selector".into()));
        }
        Ok(())
    }
}

/// First selector from `candidates` present in `snapshot`.
fn first_match<'a>(snapshot: &str, candidates: &'a [Selector]) -> Option<(Point, &'a Selector)> {
    candidates
        .iter()
        .find_map(|s| find_in_snapshot(snapshot, s).map(|p| (p, s)))
}

/// The national part of `phone` once `prefix` is removed.
fn national_number<'a>(phone: &'a str, prefix: Option<&str>) -> &'a str {
    let digits = phone.trim_start_matches('+');
    match prefix.map(|p| p.trim_start_matches('+')) {
        Some(p) if !p.is_empty() => digits.strip_prefix(p).unwrap_or(digits),
        _ => digits,
    }
}

pub struct PlaybookDriver {
    playbook: Playbook,
}

impl PlaybookDriver {
    pub fn new(playbook: Playbook) -> Self {
        Self { playbook }
    }

    fn rejected(&self, snapshot: &str) -> Option<StepOutcome> {
        first_match(snapshot, &self.playbook.rejection).map(|(_, selector)| {
            StepOutcome::Failed(format!("number blocked by application ({selector})"))
        })
    }

    async fn prepare(&self, step: &StepContext<'_>) -> StepOutcome {
        let pb = &self.playbook;
        if step.attempt == 0 {
            for command in &pb.prepare_commands {
                if step.device.run_shell(command, PREPARE_COMMAND_TIMEOUT).await.is_none() {
                    warn!(command = %command, "Preparation command failed");
                }
            }
            if pb.settle_ms > 0 {
                tokio::time::sleep(Duration::from_millis(pb.settle_ms)).await;
            }
        }
        if pb.accept.is_empty() {
            return StepOutcome::Done;
        }

        let snapshot = step.device.snapshot().await;
        if let Some((point, selector)) = first_match(&snapshot, &pb.accept) {
            debug!(selector = %selector, "Accepting");
            step.device.tap(point).await;
            return StepOutcome::Done;
        }
        if step.attempt + 1 >= pb.accept_attempts.max(1) {
            if let Some(point) = pb.accept_fallback_tap {
                debug!(?point, "Accept element not found, tapping fallback");
                step.device.tap(point).await;
            }
            return StepOutcome::Done;
        }
        StepOutcome::Pending
    }

    async fn enter_number(&self, step: &StepContext<'_>) -> StepOutcome {
        let pb = &self.playbook;
        let snapshot = step.device.snapshot().await;
        if let Some(outcome) = self.rejected(&snapshot) {
            return outcome;
        }
        let Some(number_point) = find_in_snapshot(&snapshot, &pb.number_field) else {
            return StepOutcome::Pending;
        };

        let prefix = step
            .task
            .attribute("dialing_prefix")
            .or(pb.dialing_prefix.as_deref());

        if let Some(prefix_selector) = &pb.prefix_field {
            let Some(prefix_point) = find_in_snapshot(&snapshot, prefix_selector) else {
                return StepOutcome::Pending;
            };
            step.device.tap(prefix_point).await;
            for _ in 0..pb.clear_keystrokes {
                step.device.key_event(KEYCODE_DEL).await;
            }
            if let Some(prefix) = prefix {
                step.device.input_text(prefix.trim_start_matches('+')).await;
            }
        }

        step.device.tap(number_point).await;
        step.device
            .input_text(national_number(&step.task.phone, prefix))
            .await;

        let after = step.device.snapshot().await;
        match first_match(&after, &pb.submit) {
            Some((point, _)) => step.device.tap(point).await,
            None if !pb.submit.is_empty() => warn!("Submit element not found after number entry"),
            None => {}
        }
        StepOutcome::Done
    }

    async fn tap_first(&self, step: &StepContext<'_>, candidates: &[Selector]) -> bool {
        let snapshot = step.device.snapshot().await;
        match first_match(&snapshot, candidates) {
            Some((point, selector)) => {
                debug!(selector = %selector, "Tapping");
                step.device.tap(point).await;
                true
            }
            None => false,
        }
    }

    async fn confirm(&self, step: &StepContext<'_>) -> StepOutcome {
        let snapshot = step.device.snapshot().await;
        if let Some(outcome) = self.rejected(&snapshot) {
            return outcome;
        }
        match first_match(&snapshot, &self.playbook.confirm) {
            Some((point, _)) => {
                step.device.tap(point).await;
                StepOutcome::Done
            }
            None if self.playbook.confirm.is_empty() => StepOutcome::Done,
            None => StepOutcome::Pending,
        }
    }

    async fn select_method(&self, step: &StepContext<'_>) -> StepOutcome {
        let pb = &self.playbook;
        if pb.alternate_method.is_empty() {
            return StepOutcome::Done;
        }
        if step.attempt == 0 {
            self.tap_first(step, &pb.dismiss).await;
        }
        if !self.tap_first(step, &pb.alternate_method).await {
            return StepOutcome::Pending;
        }
        if self.tap_first(step, &pb.method).await {
            self.tap_first(step, &pb.method_continue).await;
        } else {
            warn!("Alternate verification method not offered");
        }
        StepOutcome::Done
    }

    async fn enter_code(&self, step: &StepContext<'_>) -> StepOutcome {
        match step.code {
            Some(code) => {
                step.device.input_text(code).await;
                StepOutcome::Done
            }
            None => StepOutcome::Failed("no verification code to enter".into()),
        }
    }

    async fn enter_profile(&self, step: &StepContext<'_>) -> StepOutcome {
        let pb = &self.playbook;
        let snapshot = step.device.snapshot().await;
        let Some((point, _)) = first_match(&snapshot, &pb.profile_field) else {
            return StepOutcome::Pending;
        };
        let name = step.task.attribute("profile_name").unwrap_or(&pb.profile_name);
        step.device.tap(point).await;
        step.device.input_text(name).await;
        step.device.key_event(KEYCODE_ENTER).await;

        if !pb.profile_submit.is_empty() && !self.tap_first(step, &pb.profile_submit).await {
            warn!("Profile submit element not found");
        }
        StepOutcome::Done
    }

    async fn await_main_screen(&self, step: &StepContext<'_>) -> StepOutcome {
        let snapshot = step.device.snapshot().await;
        if let Some(outcome) = self.rejected(&snapshot) {
            return outcome;
        }
        if first_match(&snapshot, &self.playbook.main_screen).is_some() {
            return StepOutcome::Done;
        }
        if let Some((point, selector)) = first_match(&snapshot, &self.playbook.dismiss) {
            debug!(selector = %selector, "Dismissing dialog");
            step.device.tap(point).await;
        }
        StepOutcome::Pending
    }
}

#[async_trait]
impl StageDriver for PlaybookDriver {
    async fn advance(&self, stage: Stage, step: &StepContext<'_>) -> StepOutcome {
        match stage {
            Stage::Preparing => self.prepare(step).await,
            Stage::EnteringNumber => self.enter_number(step).await,
            Stage::AwaitingConfirmation => self.confirm(step).await,
            Stage::SelectingVerificationMethod => self.select_method(step).await,
            Stage::AwaitingVerificationCode => self.enter_code(step).await,
            Stage::EnteringProfile => self.enter_profile(step).await,
            Stage::AwaitingMainScreen => self.await_main_screen(step).await,
            _ => StepOutcome::Done,
        }
    }
}
