//! Status reporter: delivers progress and outcomes with bounded retry.
//!
//! Delivery failures are logged and dropped. Nothing here returns an error
//! to the caller, so a flaky reporting channel never changes a task's
//! outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::jobs::StatusReport;
use crate::source::TaskSource;

pub struct StatusReporter {
    source: Arc<dyn TaskSource>,
    attempts: u32,
    delay: Duration,
}

impl StatusReporter {
    pub fn new(source: Arc<dyn TaskSource>, attempts: u32, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            source,
            attempts: attempts.max(1),
            delay,
        })
    }

    /// Deliver `report`, retrying up to the configured attempt count.
    /// Returns whether it was delivered.
    pub async fn report(&self, report: &StatusReport) -> bool {
        for attempt in 1..=self.attempts {
            match self.source.post_status(report).await {
                Ok(()) => {
                    debug!(phone = %report.phone, status = %report.status, attempt, "Status delivered");
                    return true;
                }
                Err(e) if attempt < self.attempts => {
                    warn!(
                        phone = %report.phone,
                        status = %report.status,
                        attempt,
                        error = %e,
                        "Status delivery failed, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => {
                    error!(
                        phone = %report.phone,
                        status = %report.status,
                        attempts = self.attempts,
                        error = %e,
                        "Failed to send status, dropping"
                    );
                }
            }
        }
        false
    }

    /// Open an ordered, non-blocking sink for one session.
    ///
    /// Reports emitted through the sink are delivered in order by a
    /// background task; `emit` never waits on the network.
    pub fn session_sink(self: &Arc<Self>) -> StatusSink {
        let (tx, mut rx) = mpsc::unbounded_channel::<StatusReport>();
        let reporter = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                reporter.report(&report).await;
            }
        });
        StatusSink { tx, handle }
    }
}

/// Per-session handle onto the reporter.
pub struct StatusSink {
    tx: mpsc::UnboundedSender<StatusReport>,
    handle: JoinHandle<()>,
}

impl StatusSink {
    /// Queue a report for delivery.
    pub fn emit(&self, report: StatusReport) {
        if self.tx.send(report).is_err() {
            warn!("Status sink closed; report dropped");
        }
    }

    /// Stop accepting reports. The returned handle completes once every
    /// queued report has been attempted.
    pub fn close(self) -> JoinHandle<()> {
        drop(self.tx);
        self.handle
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::TransportError;
    use crate::jobs::{ControlSignal, JobPayload, ReportStatus};

    /// Fails the first `failures` deliveries, records the rest.
    pub(crate) struct FlakySource {
        pub failures: usize,
        pub calls: AtomicUsize,
        pub delivered: Mutex<Vec<StatusReport>>,
    }

    impl FlakySource {
        pub(crate) fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicUsize::new(0),
                delivered: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TaskSource for FlakySource {
        async fn poll(&self, _capacity: usize) -> Result<Vec<JobPayload>, TransportError> {
            Ok(Vec::new())
        }

        async fn post_status(&self, report: &StatusReport) -> Result<(), TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(TransportError::Status {
                    endpoint: "/agent/status".into(),
                    status: 503,
                });
            }
            self.delivered.lock().unwrap().push(report.clone());
            Ok(())
        }

        async fn control(&self, _phone: &str) -> Result<ControlSignal, TransportError> {
            Ok(ControlSignal::default())
        }
    }

    fn report() -> StatusReport {
        StatusReport::new("+1555", ReportStatus::Completed).with_code("12345")
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_after_transient_failures() {
        let source = FlakySource::new(2);
        let reporter = StatusReporter::new(source.clone(), 3, Duration::from_secs(1));

        assert!(reporter.report(&report()).await);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(source.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_exact_attempt_count() {
        let source = FlakySource::new(usize::MAX);
        let reporter = StatusReporter::new(source.clone(), 3, Duration::from_secs(1));

        assert!(!reporter.report(&report()).await);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert!(source.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_attempts() {
        let source = FlakySource::new(1);
        let reporter = StatusReporter::new(source.clone(), 3, Duration::from_secs(1));

        let start = tokio::time::Instant::now();
        reporter.report(&report()).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn sink_preserves_order() {
        let source = FlakySource::new(0);
        let reporter = StatusReporter::new(source.clone(), 3, Duration::from_millis(1));

        let sink = reporter.session_sink();
        sink.emit(StatusReport::new("+1555", ReportStatus::Starting));
        sink.emit(StatusReport::new("+1555", ReportStatus::ReadyForCode));
        sink.emit(report());
        sink.close().await.unwrap();

        let statuses: Vec<ReportStatus> = source
            .delivered
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                ReportStatus::Starting,
                ReportStatus::ReadyForCode,
                ReportStatus::Completed
            ]
        );
    }
}
