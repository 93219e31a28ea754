//! Cooperative cancellation of running sessions.
//!
//! Handles are keyed by session id, so the same phone running on two slots
//! gets two independent handles. Sessions poll their handle at every wait
//! iteration; nothing here interrupts an in-flight device call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Why a session was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// External stop signal for the task.
    Requested,
    /// Heartbeat monitor declared the slot hung.
    Stalled,
    /// Process shutdown.
    Shutdown,
}

/// One session's cancellation handle.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl CancelHandle {
    fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// Cancel with `reason`. The first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reason for cancellation; a cancelled parent reads as shutdown.
    pub fn reason(&self) -> Option<CancelReason> {
        if !self.token.is_cancelled() {
            return None;
        }
        Some(self.reason.get().copied().unwrap_or(CancelReason::Shutdown))
    }

    /// Completes when the handle is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

struct Registered {
    phone: String,
    handle: CancelHandle,
}

/// Live cancellation handles by session id.
pub struct CancellationRegistry {
    root: CancellationToken,
    handles: Mutex<HashMap<Uuid, Registered>>,
}

impl CancellationRegistry {
    /// Handles registered here are children of `root`.
    pub fn new(root: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            root,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Create the handle for session `session_id` running `phone`.
    pub fn register(&self, session_id: Uuid, phone: &str) -> CancelHandle {
        let handle = CancelHandle::child_of(&self.root);
        self.lock().insert(
            session_id,
            Registered {
                phone: phone.to_string(),
                handle: handle.clone(),
            },
        );
        handle
    }

    /// Cancel every session running `phone`. Returns how many were found.
    pub fn cancel(&self, phone: &str, reason: CancelReason) -> usize {
        let handles = self.lock();
        let mut cancelled = 0;
        for (session_id, entry) in handles.iter().filter(|(_, e)| e.phone == phone) {
            info!(phone = %phone, %session_id, ?reason, "Cancelling session");
            entry.handle.cancel(reason);
            cancelled += 1;
        }
        cancelled
    }

    /// Cancel one session. Returns whether it was still registered.
    pub fn cancel_session(&self, session_id: Uuid, reason: CancelReason) -> bool {
        match self.lock().get(&session_id) {
            Some(entry) => {
                info!(phone = %entry.phone, %session_id, ?reason, "Cancelling session");
                entry.handle.cancel(reason);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, session_id: Uuid) {
        self.lock().remove(&session_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Registered>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }
}
