//! Execution session: one task's lifecycle on one slot.
//!
//! Every waiting stage polls its driver on a short interval up to a
//! stage timeout. Each iteration first checks the cancellation handle and
//! the remote stop signal, and beats the heartbeat board when due. Longer
//! sleeps are cut into poll-interval steps with the same checks between
//! them, so a stop is seen within one poll interval wherever it lands.
//! Status reports go through a per-session sink, so delivery never blocks
//! or alters the session.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cancel::{CancelHandle, CancelReason, CancellationRegistry};
use super::classify::FailureClassifier;
use super::heartbeat::HeartbeatBoard;
use super::state::{SessionState, Stage};
use crate::config::SessionConfig;
use crate::device::DeviceControl;
use crate::error::{ConfigError, SessionError};
use crate::jobs::{ControlSignal, ReportStatus, Slot, StatusReport, Task};
use crate::playbook::{StageDriver, StepContext, StepOutcome};
use crate::source::TaskSource;
use crate::status::{StatusReporter, StatusSink};
use crate::verification::CodeProvider;

/// Session timings with the compiled code pattern and classifier.
#[derive(Debug)]
pub struct SessionSettings {
    pub config: SessionConfig,
    code_pattern: Regex,
    classifier: FailureClassifier,
}

impl SessionSettings {
    pub fn new(config: SessionConfig) -> Result<Self, ConfigError> {
        let code_pattern =
            Regex::new(&config.secondary_code_pattern).map_err(|e| ConfigError::InvalidValue {
                key: "secondary_code_pattern".to_string(),
                message: e.to_string(),
            })?;
        if config.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "poll_interval".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if code_pattern.captures_len() < 2 {
            return Err(ConfigError::InvalidValue {
                key: "secondary_code_pattern".to_string(),
                message: "pattern needs a capture group for the code".to_string(),
            });
        }
        let classifier = FailureClassifier::new(&config.blocked_patterns);
        Ok(Self {
            config,
            code_pattern,
            classifier,
        })
    }
}

/// Shared collaborators handed to every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub driver: Arc<dyn StageDriver>,
    pub codes: Arc<dyn CodeProvider>,
    pub source: Arc<dyn TaskSource>,
    pub reporter: Arc<StatusReporter>,
    pub heartbeats: Arc<HeartbeatBoard>,
    pub cancellations: Arc<CancellationRegistry>,
    pub settings: Arc<SessionSettings>,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Reached the end; `codes` holds every secondary code reported.
    Completed { codes: Vec<String> },
    /// Ended on an error; `error` is the text sent in the failed report.
    Failed { error: String },
    Cancelled,
}

#[derive(Debug)]
pub struct SessionResult {
    pub session_id: Uuid,
    pub phone: String,
    pub slot_id: String,
    pub stage: Stage,
    pub outcome: SessionOutcome,
    pub elapsed: Duration,
    /// Completes once every report from this session has been attempted.
    pub deliveries: JoinHandle<()>,
}

pub struct ExecutionSession {
    state: SessionState,
    device: Arc<dyn DeviceControl>,
    deps: SessionDeps,
    cancel: CancelHandle,
    sink: StatusSink,
    last_beat: Instant,
    codes: Vec<String>,
}

fn cancel_error(reason: CancelReason) -> SessionError {
    match reason {
        CancelReason::Stalled => SessionError::Stalled,
        CancelReason::Requested | CancelReason::Shutdown => SessionError::Cancelled,
    }
}

impl ExecutionSession {
    /// Registers the session for cancellation and heartbeats. Must be
    /// called inside a tokio runtime.
    pub fn new(task: Task, slot: Slot, device: Arc<dyn DeviceControl>, deps: SessionDeps) -> Self {
        let state = SessionState::new(task, slot);
        let cancel = deps.cancellations.register(state.session_id, &state.task.phone);
        deps.heartbeats.begin(&state.slot.id, state.session_id, &state.task.phone);
        let sink = deps.reporter.session_sink();
        Self {
            state,
            device,
            deps,
            cancel,
            sink,
            last_beat: Instant::now(),
            codes: Vec::new(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.state.session_id
    }

    /// Run to a terminal stage. Never fails; the outcome is in the result.
    pub async fn run(mut self) -> SessionResult {
        let started = Instant::now();
        info!(
            slot = %self.state.slot.id,
            phone = %self.state.task.phone,
            session_id = %self.state.session_id,
            "Session started"
        );

        let outcome = match self.execute().await {
            Ok(()) => {
                self.finish(Stage::Completed);
                info!(
                    slot = %self.state.slot.id,
                    phone = %self.state.task.phone,
                    codes = self.codes.len(),
                    "Session completed"
                );
                SessionOutcome::Completed {
                    codes: self.codes.clone(),
                }
            }
            Err(err) => self.fail(err),
        };

        self.deps.heartbeats.end(&self.state.slot.id);
        self.deps.cancellations.remove(self.state.session_id);

        let Self { state, sink, .. } = self;
        SessionResult {
            session_id: state.session_id,
            phone: state.task.phone,
            slot_id: state.slot.id,
            stage: state.stage,
            outcome,
            elapsed: started.elapsed(),
            deliveries: sink.close(),
        }
    }

    async fn execute(&mut self) -> Result<(), SessionError> {
        if self.state.slot.port().is_none() {
            return Err(SessionError::InvalidSlot(self.state.slot.device_address.clone()));
        }
        let settings = Arc::clone(&self.deps.settings);
        let cfg = &settings.config;

        self.sink.emit(self.report(ReportStatus::Starting));

        self.enter(Stage::Preparing)?;
        self.wait_stage(cfg.prepare_timeout, None).await?;

        self.enter(Stage::EnteringNumber)?;
        self.wait_stage(cfg.number_entry_timeout, None).await?;

        self.enter(Stage::AwaitingConfirmation)?;
        self.wait_stage(cfg.confirmation_timeout, None).await?;

        self.enter(Stage::SelectingVerificationMethod)?;
        self.wait_stage(cfg.method_selection_timeout, None).await?;
        self.sink.emit(self.report(ReportStatus::ReadyForCode));

        self.enter(Stage::AwaitingVerificationCode)?;
        let code = self.await_code(cfg.code_wait_timeout).await?;
        info!(
            slot = %self.state.slot.id,
            phone = %self.state.task.phone,
            "Verification code received"
        );
        self.wait_stage(cfg.code_entry_timeout, Some(&code)).await?;

        self.enter(Stage::EnteringProfile)?;
        self.wait_stage(cfg.profile_timeout, None).await?;

        self.enter(Stage::AwaitingMainScreen)?;
        self.wait_stage(cfg.main_screen_timeout, None).await?;

        self.enter(Stage::MonitoringForSecondaryCode)?;
        self.monitor_codes(cfg, &settings.code_pattern).await
    }

    fn enter(&mut self, stage: Stage) -> Result<(), SessionError> {
        self.state.transition_to(stage).map_err(SessionError::Aborted)?;
        debug!(slot = %self.state.slot.id, phone = %self.state.task.phone, stage = %stage, "Stage entered");
        self.beat();
        Ok(())
    }

    /// Poll the driver for the current stage until it is done or `timeout`
    /// runs out. Optional stages only log when time runs out.
    async fn wait_stage(&mut self, timeout: Duration, code: Option<&str>) -> Result<(), SessionError> {
        let stage = self.state.stage;
        let deadline = Instant::now() + timeout;
        let poll_interval = self.deps.settings.config.poll_interval;
        let mut attempt = 0;
        loop {
            self.checkpoint().await?;
            let step = StepContext {
                device: self.device.as_ref(),
                task: &self.state.task,
                attempt,
                code,
            };
            match self.deps.driver.advance(stage, &step).await {
                StepOutcome::Done => return Ok(()),
                StepOutcome::Failed(reason) => return Err(SessionError::StepFailed { stage, reason }),
                StepOutcome::Pending => {}
            }
            attempt += 1;
            if Instant::now() >= deadline {
                if stage.is_optional() {
                    warn!(
                        slot = %self.state.slot.id,
                        phone = %self.state.task.phone,
                        stage = %stage,
                        waited_secs = timeout.as_secs(),
                        "Optional stage timed out, continuing"
                    );
                    return Ok(());
                }
                return Err(SessionError::StageTimeout { stage, waited: timeout });
            }
            self.pause(poll_interval).await?;
        }
    }

    /// Wait for the externally delivered verification code.
    async fn await_code(&mut self, timeout: Duration) -> Result<String, SessionError> {
        let codes = Arc::clone(&self.deps.codes);
        let phone = self.state.task.phone.clone();
        let request = async move { codes.request_callback_code(&phone, timeout).await };
        tokio::pin!(request);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let cancel = self.cancel.clone();
        let poll_interval = self.deps.settings.config.poll_interval;

        loop {
            tokio::select! {
                response = &mut request => {
                    return match response {
                        Ok(Some(response)) => response.code().ok_or(SessionError::VerificationNotReceived),
                        Ok(None) => Err(SessionError::VerificationNotReceived),
                        Err(e) => {
                            warn!(phone = %self.state.task.phone, error = %e, "Code service request failed");
                            Err(SessionError::VerificationNotReceived)
                        }
                    };
                }
                _ = &mut deadline => return Err(SessionError::VerificationNotReceived),
                _ = cancel.cancelled() => return Err(self.cancelled_error()),
                _ = tokio::time::sleep(poll_interval) => self.checkpoint().await?,
            }
        }
    }

    /// Scan the screen for secondary codes. The first window waits for
    /// the first code; each new code re-arms the monitoring window. Once
    /// a code has been reported, stop signals end monitoring normally.
    async fn monitor_codes(&mut self, cfg: &SessionConfig, pattern: &Regex) -> Result<(), SessionError> {
        let mut deadline = Instant::now() + cfg.first_code_timeout;
        loop {
            if let Err(err) = self.checkpoint().await {
                return self.stop_monitoring(err);
            }
            for code in self.scan_codes(pattern).await {
                info!(
                    slot = %self.state.slot.id,
                    phone = %self.state.task.phone,
                    code = %code,
                    "Secondary code detected"
                );
                self.sink.emit(self.report(ReportStatus::Completed).with_code(&code));
                self.codes.push(code);
                deadline = Instant::now() + cfg.second_code_window;
            }
            if Instant::now() >= deadline {
                if self.codes.is_empty() {
                    warn!(
                        slot = %self.state.slot.id,
                        phone = %self.state.task.phone,
                        waited_secs = cfg.first_code_timeout.as_secs(),
                        "No secondary code detected"
                    );
                    self.sink.emit(self.report(ReportStatus::Completed));
                }
                return Ok(());
            }
            if let Err(err) = self.pause(cfg.code_scan_interval).await {
                return self.stop_monitoring(err);
            }
        }
    }

    fn stop_monitoring(&self, err: SessionError) -> Result<(), SessionError> {
        if self.codes.is_empty() {
            return Err(err);
        }
        info!(
            slot = %self.state.slot.id,
            phone = %self.state.task.phone,
            reason = %err,
            "Secondary code monitoring stopped"
        );
        Ok(())
    }

    /// New distinct codes on the current screen, in screen order.
    async fn scan_codes(&self, pattern: &Regex) -> Vec<String> {
        let snapshot = self.device.snapshot().await;
        let mut found: Vec<String> = Vec::new();
        for caps in pattern.captures_iter(&snapshot) {
            if let Some(code) = caps.get(1).map(|m| m.as_str())
                && !self.codes.iter().any(|c| c == code)
                && !found.iter().any(|c| c == code)
            {
                found.push(code.to_string());
            }
        }
        found
    }

    /// Per-iteration checks: local cancellation, heartbeat, remote stop.
    async fn checkpoint(&mut self) -> Result<(), SessionError> {
        self.ensure_live()?;
        if self.last_beat.elapsed() >= self.deps.settings.config.heartbeat_interval {
            self.beat();
        }
        if let Some(signal) = self.poll_control().await {
            if signal.stop_requested {
                info!(
                    slot = %self.state.slot.id,
                    phone = %self.state.task.phone,
                    stage = %self.state.stage,
                    "Stop requested"
                );
                self.cancel.cancel(CancelReason::Requested);
            } else if signal.second_code_requested && self.state.stage == Stage::MonitoringForSecondaryCode {
                debug!(phone = %self.state.task.phone, "Secondary code requested");
            }
        }
        self.ensure_live()
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        match self.cancel.reason() {
            None => Ok(()),
            Some(reason) => Err(cancel_error(reason)),
        }
    }

    fn cancelled_error(&self) -> SessionError {
        cancel_error(self.cancel.reason().unwrap_or(CancelReason::Shutdown))
    }

    /// The remote control signal. Transport errors read as no signal.
    async fn poll_control(&self) -> Option<ControlSignal> {
        match self.deps.source.control(&self.state.task.phone).await {
            Ok(signal) => Some(signal),
            Err(e) => {
                debug!(phone = %self.state.task.phone, error = %e, "Control signal unavailable");
                None
            }
        }
    }

    /// Sleep for `wait`, waking early on cancellation. Waits longer than
    /// the poll interval run a checkpoint after every interval.
    async fn pause(&mut self, wait: Duration) -> Result<(), SessionError> {
        let poll_interval = self.deps.settings.config.poll_interval;
        let until = Instant::now() + wait;
        loop {
            let nap = until.saturating_duration_since(Instant::now()).min(poll_interval);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(self.cancelled_error()),
                _ = tokio::time::sleep(nap) => {}
            }
            if Instant::now() >= until {
                return Ok(());
            }
            self.checkpoint().await?;
        }
    }

    fn beat(&mut self) {
        self.deps.heartbeats.beat(&self.state.slot.id, self.state.stage);
        self.state.record_heartbeat();
        self.last_beat = Instant::now();
    }

    fn report(&self, status: ReportStatus) -> StatusReport {
        StatusReport::new(&self.state.task.phone, status).with_emulator(&self.state.slot.id)
    }

    fn finish(&mut self, stage: Stage) {
        if let Err(e) = self.state.transition_to(stage) {
            debug!(phone = %self.state.task.phone, error = %e, "Terminal transition skipped");
        }
    }

    fn fail(&mut self, err: SessionError) -> SessionOutcome {
        let error = self.deps.settings.classifier.classify(&err);
        let stage = self.state.stage;
        let outcome = if err.is_cancellation() {
            info!(
                slot = %self.state.slot.id,
                phone = %self.state.task.phone,
                stage = %stage,
                reason = ?self.cancel.reason(),
                "Session cancelled"
            );
            self.finish(Stage::Cancelled);
            SessionOutcome::Cancelled
        } else {
            error!(
                slot = %self.state.slot.id,
                phone = %self.state.task.phone,
                stage = %stage,
                error = %err,
                "Session failed"
            );
            self.finish(Stage::Failed);
            SessionOutcome::Failed { error: error.clone() }
        };
        self.sink.emit(self.report(ReportStatus::Failed).with_error(error));
        outcome
    }
}
