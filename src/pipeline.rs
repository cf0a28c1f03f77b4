use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::absence;
use crate::models::{AbsenceAlert, AlertRequest};
use crate::sources::{AlertSender, AlertStore, AttendanceStore, StudentDirectory};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Absence count at which a parent alert is due.
    pub absence_threshold: u32,
    /// Quiet period that coalesces attendance changes into one batch.
    pub debounce: Duration,
    /// Pause between students within a batch to bound store and sender load.
    pub student_pause: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            absence_threshold: 3,
            debounce: Duration::from_millis(2000),
            student_pause: Duration::from_millis(150),
        }
    }
}

/// Cheap handle the processor (or any attendance writer) uses to signal
/// that some student's attendance changed. Dropped signals only happen when
/// the pipeline is already shut down, and are logged.
#[derive(Clone)]
pub struct ChangeNotifier {
    tx: mpsc::UnboundedSender<()>,
}

impl ChangeNotifier {
    pub fn notify(&self) {
        if self.tx.send(()).is_err() {
            warn!("absence pipeline not running; change notification dropped");
        }
    }
}

/// Owner handle for the spawned pipeline task. Shutdown cancels any pending
/// debounce timer and in-flight batch without awaiting outstanding
/// deliveries.
pub struct PipelineHandle {
    notifier: ChangeNotifier,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl PipelineHandle {
    pub fn notifier(&self) -> ChangeNotifier {
        self.notifier.clone()
    }

    pub async fn shutdown(self) {
        self.token.cancel();
        if self.task.await.is_err() {
            warn!("absence pipeline task panicked during shutdown");
        }
    }
}

/// Debounced, serialized absence alerter. Watches aggregate absence counts
/// and emits at most one parent alert per threshold crossing, monotonically:
/// once a confirmed alert exists at count N, counts ≤ N never alert again.
pub struct AbsenceAlertPipeline {
    attendance: Arc<dyn AttendanceStore>,
    directory: Arc<dyn StudentDirectory>,
    alerts: Arc<dyn AlertStore>,
    sender: Arc<dyn AlertSender>,
    config: PipelineConfig,
    /// Serializes batches: a debounce firing while a batch runs is skipped.
    batch_active: AtomicBool,
    /// Students currently being evaluated, to block re-entrant evaluation
    /// across overlapping batch and manual recheck paths.
    in_flight: Mutex<HashSet<String>>,
}

impl AbsenceAlertPipeline {
    pub fn new(
        attendance: Arc<dyn AttendanceStore>,
        directory: Arc<dyn StudentDirectory>,
        alerts: Arc<dyn AlertStore>,
        sender: Arc<dyn AlertSender>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            attendance,
            directory,
            alerts,
            sender,
            config,
            batch_active: AtomicBool::new(false),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Start the background debounce task. The returned handle owns its
    /// lifecycle; dropping all notifiers also stops the task.
    pub fn spawn(self: Arc<Self>) -> PipelineHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&self).run(rx, token.clone()));
        PipelineHandle {
            notifier: ChangeNotifier { tx },
            token,
            task,
        }
    }

    async fn run(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<()>,
        token: CancellationToken,
    ) {
        info!("absence alert pipeline started");
        'main: loop {
            tokio::select! {
                _ = token.cancelled() => break 'main,
                message = rx.recv() => {
                    if message.is_none() {
                        break 'main;
                    }
                    // Debounce: wait out the quiet period, then fold every
                    // queued notification into a single batch pass.
                    tokio::select! {
                        _ = token.cancelled() => break 'main,
                        _ = tokio::time::sleep(self.config.debounce) => {}
                    }
                    while rx.try_recv().is_ok() {}
                    if let Err(error) = self.run_batch(&token).await {
                        error!(%error, "absence alert batch failed");
                    }
                }
            }
        }
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("absence alert pipeline stopped");
    }

    /// Run one full evaluation pass over all students with attendance
    /// history. Skipped entirely when a batch is already in flight.
    pub async fn run_batch(&self, token: &CancellationToken) -> anyhow::Result<()> {
        if self.batch_active.swap(true, Ordering::SeqCst) {
            debug!("absence alert batch already in flight; skipping");
            return Ok(());
        }
        let result = self.batch_inner(token).await;
        self.batch_active.store(false, Ordering::SeqCst);
        result
    }

    /// Convenience for manual rechecks outside the debounce loop.
    pub async fn run_once(&self) -> anyhow::Result<()> {
        self.run_batch(&CancellationToken::new()).await
    }

    async fn batch_inner(&self, token: &CancellationToken) -> anyhow::Result<()> {
        let student_ids = self.attendance.student_ids_with_history().await?;
        debug!(students = student_ids.len(), "running absence alert batch");

        for student_id in student_ids {
            if token.is_cancelled() {
                break;
            }
            let evaluation = tokio::select! {
                _ = token.cancelled() => break,
                result = self.evaluate_student(&student_id) => result,
            };
            if let Err(error) = evaluation {
                error!(%student_id, %error, "absence evaluation failed");
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.student_pause) => {}
            }
        }
        Ok(())
    }

    /// Evaluate one student: recount absences, apply threshold and monotonic
    /// suppression, then record-then-deliver. Missing contact data is a
    /// skip, not an error; delivery failure leaves the pending entry so a
    /// later count increase can re-attempt. Both the batch and the manual
    /// recheck path go through the per-student in-flight guard here.
    pub async fn evaluate_student(&self, student_id: &str) -> anyhow::Result<()> {
        let Some(_guard) = self.try_begin(student_id) else {
            debug!(%student_id, "student evaluation already in flight; skipping");
            return Ok(());
        };
        self.evaluate_inner(student_id).await
    }

    async fn evaluate_inner(&self, student_id: &str) -> anyhow::Result<()> {
        let history = self.attendance.all_days(student_id).await?;
        let summary = absence::count_absences(&history);
        if summary.count < self.config.absence_threshold {
            return Ok(());
        }

        let history_alerts = self.alerts.get_alerts(student_id).await?;
        let suppressed = history_alerts
            .iter()
            .any(|alert| alert.email_sent && alert.total_absences_at_time >= summary.count);
        if suppressed {
            debug!(%student_id, count = summary.count, "alert already confirmed at this count");
            return Ok(());
        }

        let Some(student) = self.directory.get_student(student_id).await? else {
            error!(%student_id, "student missing from directory; cannot alert");
            return Ok(());
        };
        let Some(parent_email) = student
            .parent_email
            .as_deref()
            .filter(|email| !email.is_empty())
        else {
            error!(%student_id, "no parent email on file; skipping absence alert");
            return Ok(());
        };

        // Durable intent marker written before delivery: a crash or failed
        // send leaves this behind without suppressing future attempts.
        let pending = AbsenceAlert {
            student_id: student_id.to_string(),
            parent_email: parent_email.to_string(),
            alert_sent_at: Utc::now().timestamp_millis(),
            total_absences_at_time: summary.count,
            absent_dates: summary.dates.clone(),
            email_sent: false,
        };
        self.alerts.append_alert(&pending).await?;

        let request = AlertRequest {
            parent_email: parent_email.to_string(),
            parent_name: student
                .parent_name
                .clone()
                .unwrap_or_else(|| "Parent/Guardian".to_string()),
            student_name: student.name.clone(),
            student_id: student_id.to_string(),
            absent_dates: summary.dates.clone(),
            total_absences: summary.count,
        };

        match self.sender.send_absence_alert(&request).await {
            Ok(true) => {
                let confirmed = AbsenceAlert {
                    email_sent: true,
                    alert_sent_at: Utc::now().timestamp_millis(),
                    ..pending
                };
                self.alerts.append_alert(&confirmed).await?;
                info!(%student_id, count = summary.count, "absence alert sent");
            }
            Ok(false) => {
                warn!(%student_id, "absence alert delivery refused; pending entry kept");
            }
            Err(error) => {
                warn!(%student_id, %error, "absence alert delivery failed; pending entry kept");
            }
        }
        Ok(())
    }

    fn try_begin(&self, student_id: &str) -> Option<InFlightGuard<'_>> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(student_id.to_string());
        inserted.then(|| InFlightGuard {
            pipeline: self,
            student_id: student_id.to_string(),
        })
    }
}

/// Removes the student from the in-flight set on drop, so a cancelled
/// evaluation cannot leave a stale entry behind.
struct InFlightGuard<'a> {
    pipeline: &'a AbsenceAlertPipeline,
    student_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.pipeline
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.student_id);
    }
}
