//! Heartbeats: liveness of busy slots, independent of task status.
//!
//! Sessions beat from inside their wait loops, so a session stuck in a
//! device call stops beating. The monitor cancels any session whose slot
//! has been silent for longer than the heartbeat timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cancel::{CancelReason, CancellationRegistry};
use super::state::Stage;

#[derive(Debug, Clone)]
struct Beat {
    session_id: Uuid,
    phone: String,
    stage: Stage,
    at: Instant,
    stalled: bool,
}

/// Snapshot of one busy slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLiveness {
    pub slot_id: String,
    pub session_id: Uuid,
    pub phone: String,
    pub stage: Stage,
    pub silent_for: Duration,
}

#[derive(Default)]
pub struct HeartbeatBoard {
    beats: Mutex<HashMap<String, Beat>>,
}

impl HeartbeatBoard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start tracking `slot_id` for a new session.
    pub fn begin(&self, slot_id: &str, session_id: Uuid, phone: &str) {
        self.lock().insert(
            slot_id.to_string(),
            Beat {
                session_id,
                phone: phone.to_string(),
                stage: Stage::Starting,
                at: Instant::now(),
                stalled: false,
            },
        );
    }

    pub fn beat(&self, slot_id: &str, stage: Stage) {
        if let Some(beat) = self.lock().get_mut(slot_id) {
            beat.stage = stage;
            beat.at = Instant::now();
            beat.stalled = false;
        }
    }

    /// Stop tracking `slot_id` (session finished).
    pub fn end(&self, slot_id: &str) {
        self.lock().remove(slot_id);
    }

    pub fn busy(&self) -> Vec<SlotLiveness> {
        let now = Instant::now();
        self.lock()
            .iter()
            .map(|(slot_id, beat)| SlotLiveness {
                slot_id: slot_id.clone(),
                session_id: beat.session_id,
                phone: beat.phone.clone(),
                stage: beat.stage,
                silent_for: now.saturating_duration_since(beat.at),
            })
            .collect()
    }

    /// Slots silent for longer than `timeout` and not yet flagged.
    /// Each stall is returned once until the slot beats again.
    pub fn take_stalled(&self, timeout: Duration) -> Vec<SlotLiveness> {
        let now = Instant::now();
        let mut stalled = Vec::new();
        for (slot_id, beat) in self.lock().iter_mut() {
            let silent_for = now.saturating_duration_since(beat.at);
            if !beat.stalled && silent_for > timeout {
                beat.stalled = true;
                stalled.push(SlotLiveness {
                    slot_id: slot_id.clone(),
                    session_id: beat.session_id,
                    phone: beat.phone.clone(),
                    stage: beat.stage,
                    silent_for,
                });
            }
        }
        stalled
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Beat>> {
        self.beats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Spawn the stalled-slot monitor.
pub fn spawn_heartbeat_monitor(
    board: Arc<HeartbeatBoard>,
    registry: Arc<CancellationRegistry>,
    interval: Duration,
    timeout: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), timeout_secs = timeout.as_secs(), "Heartbeat monitor started");
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            for stalled in board.take_stalled(timeout) {
                warn!(
                    slot = %stalled.slot_id,
                    phone = %stalled.phone,
                    stage = %stalled.stage,
                    silent_secs = stalled.silent_for.as_secs(),
                    "Slot missed heartbeats, treating session as failed"
                );
                if !registry.cancel_session(stalled.session_id, CancelReason::Stalled) {
                    debug!(phone = %stalled.phone, session_id = %stalled.session_id, "No live session to cancel");
                }
            }
        }
        info!("Heartbeat monitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn stale_slot_reported_once() {
        let board = HeartbeatBoard::new();
        board.begin("slot-a", Uuid::new_v4(), "+1555");
        board.begin("slot-b", Uuid::new_v4(), "+1666");

        tokio::time::advance(Duration::from_secs(60)).await;
        board.beat("slot-b", Stage::AwaitingMainScreen);
        tokio::time::advance(Duration::from_secs(61)).await;

        let stalled = board.take_stalled(Duration::from_secs(120));
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].slot_id, "slot-a");
        assert_eq!(stalled[0].stage, Stage::Starting);

        assert!(board.take_stalled(Duration::from_secs(120)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ended_slots_are_not_tracked() {
        let board = HeartbeatBoard::new();
        board.begin("slot-a", Uuid::new_v4(), "+1555");
        board.end("slot-a");
        tokio::time::advance(Duration::from_secs(500)).await;
        assert!(board.take_stalled(Duration::from_secs(120)).is_empty());
        assert!(board.busy().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_cancels_stalled_session() {
        let board = HeartbeatBoard::new();
        let shutdown = CancellationToken::new();
        let registry = CancellationRegistry::new(shutdown.clone());
        let stalled_id = Uuid::new_v4();
        let stalled = registry.register(stalled_id, "+1555");
        board.begin("slot-a", stalled_id, "+1555");
        // Same phone on another slot, still beating.
        let healthy_id = Uuid::new_v4();
        let healthy = registry.register(healthy_id, "+1555");
        board.begin("slot-b", healthy_id, "+1555");

        let monitor = spawn_heartbeat_monitor(
            Arc::clone(&board),
            Arc::clone(&registry),
            Duration::from_secs(10),
            Duration::from_secs(120),
            shutdown.clone(),
        );

        for _ in 0..27 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            board.beat("slot-b", Stage::EnteringNumber);
        }
        assert_eq!(stalled.reason(), Some(CancelReason::Stalled));
        assert!(!healthy.is_cancelled());

        shutdown.cancel();
        monitor.await.unwrap();
    }
}
