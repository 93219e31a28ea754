//! Agent lifecycle.
//!
//! Builds the shared pool, queue, heartbeat board and cancellation
//! registry, spawns the coordinator, one worker per slot and the heartbeat
//! monitor, then waits for all of them after shutdown.

use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{AgentConfig, SessionConfig};
use crate::device::DeviceControl;
use crate::dispatch::{Coordinator, PollTiming, SlotPool, SlotWorker};
use crate::error::{ConfigError, Error};
use crate::jobs::{Slot, TaskQueue};
use crate::playbook::StageDriver;
use crate::session::{CancellationRegistry, HeartbeatBoard, SessionDeps, SessionSettings, spawn_heartbeat_monitor};
use crate::source::TaskSource;
use crate::status::StatusReporter;
use crate::verification::CodeProvider;

/// External collaborators.
pub struct AgentDeps {
    pub source: Arc<dyn TaskSource>,
    pub driver: Arc<dyn StageDriver>,
    pub codes: Arc<dyn CodeProvider>,
    /// Fixed for the whole run, each with its device handle.
    pub slots: Vec<(Slot, Arc<dyn DeviceControl>)>,
}

pub struct Agent {
    config: AgentConfig,
    settings: Arc<SessionSettings>,
    deps: AgentDeps,
}

impl Agent {
    pub fn new(config: AgentConfig, session: SessionConfig, deps: AgentDeps) -> Result<Self, Error> {
        if deps.slots.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "EMULATOR_COUNT".to_string(),
                message: "no device slots available".to_string(),
            }
            .into());
        }
        let settings = Arc::new(SessionSettings::new(session)?);
        Ok(Self { config, settings, deps })
    }

    pub fn slot_count(&self) -> usize {
        self.deps.slots.len()
    }

    /// Run until `shutdown` is cancelled. Cancelling it also cancels every
    /// in-flight session at its next wait iteration.
    pub async fn run(self, shutdown: CancellationToken) {
        let Self { config, settings, deps } = self;
        let total_slots = deps.slots.len();

        let pool = SlotPool::new();
        let queue = TaskQueue::new();
        let heartbeats = HeartbeatBoard::new();
        let cancellations = CancellationRegistry::new(shutdown.clone());
        let reporter = StatusReporter::new(
            Arc::clone(&deps.source),
            config.status_retry,
            config.status_retry_delay,
        );
        let session_deps = SessionDeps {
            driver: deps.driver,
            codes: deps.codes,
            source: Arc::clone(&deps.source),
            reporter,
            heartbeats: Arc::clone(&heartbeats),
            cancellations: Arc::clone(&cancellations),
            settings: Arc::clone(&settings),
        };

        info!(
            agent_id = %config.agent_id,
            handler = %config.handler_url,
            slots = total_slots,
            "Agent starting"
        );

        let mut handles = Vec::with_capacity(total_slots + 2);
        handles.push(spawn_heartbeat_monitor(
            heartbeats,
            cancellations,
            settings.config.heartbeat_interval,
            settings.config.heartbeat_timeout,
            shutdown.clone(),
        ));
        handles.push(
            Coordinator::new(
                Arc::clone(&deps.source),
                Arc::clone(&pool),
                Arc::clone(&queue),
                total_slots,
                PollTiming::from_config(&config),
            )
            .spawn(shutdown.clone()),
        );
        for (slot, device) in deps.slots {
            handles.push(
                SlotWorker::new(
                    slot,
                    device,
                    Arc::clone(&pool),
                    Arc::clone(&queue),
                    session_deps.clone(),
                    config.worker_poll_interval,
                )
                .spawn(shutdown.clone()),
            );
        }

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                error!(error = %e, "Agent task ended abnormally");
            }
        }
        info!(unfinished = queue.unfinished(), "Agent stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::runner::tests::{FixedCode, RecordingSource, ScriptedDriver};

    #[test]
    fn requires_at_least_one_slot() {
        let deps = AgentDeps {
            source: Arc::new(RecordingSource::default()),
            driver: Arc::new(ScriptedDriver::default()),
            codes: Arc::new(FixedCode(None)),
            slots: Vec::new(),
        };
        let err = Agent::new(AgentConfig::default(), SessionConfig::default(), deps)
            .err()
            .unwrap();
        assert!(err.to_string().contains("no device slots"));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_every_loop_on_shutdown() {
        let source = Arc::new(RecordingSource::default());
        let slots: Vec<(Slot, Arc<dyn DeviceControl>)> = ["127.0.0.1:21503", "127.0.0.1:21513"]
            .into_iter()
            .map(|a| {
                let device: Arc<dyn DeviceControl> =
                    Arc::new(crate::session::runner::tests::FakeScreen::default());
                (Slot::from_address(a), device)
            })
            .collect();
        let agent = Agent::new(
            AgentConfig::default(),
            SessionConfig::default(),
            AgentDeps {
                source,
                driver: Arc::new(ScriptedDriver::default()),
                codes: Arc::new(FixedCode(None)),
                slots,
            },
        )
        .unwrap();
        assert_eq!(agent.slot_count(), 2);

        let shutdown = CancellationToken::new();
        let running = tokio::spawn(agent.run(shutdown.clone()));
        tokio::time::sleep(std::time::Duration::from_secs(12)).await;
        shutdown.cancel();
        running.await.unwrap();
    }
}
