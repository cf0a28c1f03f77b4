use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::FixedOffset;
use tracing::{debug, info, warn};

use crate::models::{AttendanceStatus, ClassAttendanceRecord, ScanEvent};
use crate::pipeline::ChangeNotifier;
use crate::schedule::{self, LocalScanTime};
use crate::sources::{AttendanceStore, ScanMarker, ScheduleSource};

/// Terminal outcome of processing one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// A schedule slot matched and a new class record was written.
    Recorded {
        class_key: String,
        status: AttendanceStatus,
    },
    /// A record already existed for the derived classKey; nothing written.
    Duplicate { class_key: String },
    /// No schedule, day slots, or slot match; a general check-in was written.
    CheckedIn { class_key: String },
}

impl ScanOutcome {
    pub fn class_key(&self) -> &str {
        match self {
            ScanOutcome::Recorded { class_key, .. }
            | ScanOutcome::Duplicate { class_key }
            | ScanOutcome::CheckedIn { class_key } => class_key,
        }
    }
}

/// Orchestrates one scan: calendar resolution, schedule matching, record
/// persistence, absence notification, and the processed marker.
pub struct AttendanceProcessor {
    schedules: Arc<dyn ScheduleSource>,
    attendance: Arc<dyn AttendanceStore>,
    scans: Arc<dyn ScanMarker>,
    notifier: Option<ChangeNotifier>,
    utc_offset: FixedOffset,
    /// Serializes the read-modify-write on one (student, date) day map so
    /// concurrent scans cannot drop each other's class records.
    day_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AttendanceProcessor {
    pub fn new(
        schedules: Arc<dyn ScheduleSource>,
        attendance: Arc<dyn AttendanceStore>,
        scans: Arc<dyn ScanMarker>,
        notifier: Option<ChangeNotifier>,
        utc_offset: FixedOffset,
    ) -> Self {
        Self {
            schedules,
            attendance,
            scans,
            notifier,
            utc_offset,
            day_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Process one scan end to end. Storage failures propagate; a duplicate
    /// classKey is a no-op. The originating scan is marked processed on
    /// every branch that completes.
    pub async fn process(&self, scan: &ScanEvent) -> anyhow::Result<ScanOutcome> {
        let local = schedule::resolve_scan_time(scan.timestamp_ms, self.utc_offset)?;

        let lock_key = format!("{}|{}", scan.student_id, local.date_key);
        let day_lock = self.day_lock(&lock_key);
        let result = {
            let _guard = day_lock.lock().await;
            self.apply_scan(scan, &local).await
        };
        self.release_day_lock(&lock_key, day_lock);
        let outcome = result?;

        if let ScanOutcome::Recorded {
            status: AttendanceStatus::Absent,
            ..
        } = outcome
        {
            // Recount failures must not fail the scan; the notifier only
            // logs when the pipeline is gone.
            if let Some(notifier) = &self.notifier {
                notifier.notify();
            }
        }

        self.scans.mark_processed(&scan.source_key).await?;

        info!(
            student_id = %scan.student_id,
            date_key = %local.date_key,
            class_key = %outcome.class_key(),
            outcome = ?outcome,
            "scan processed"
        );
        Ok(outcome)
    }

    async fn apply_scan(
        &self,
        scan: &ScanEvent,
        local: &LocalScanTime,
    ) -> anyhow::Result<ScanOutcome> {
        let Some(weekly) = self.schedules.get_schedule(&scan.student_id).await? else {
            debug!(student_id = %scan.student_id, "no schedule; falling back to general check-in");
            return self.general_check_in(scan, local).await;
        };

        let mut slots = weekly.slots_for(&local.day_of_week).to_vec();
        if slots.is_empty() {
            debug!(
                student_id = %scan.student_id,
                day = %local.day_of_week,
                "no slots for day; falling back to general check-in"
            );
            return self.general_check_in(scan, local).await;
        }

        let mut day = self
            .attendance
            .get_day(&scan.student_id, &local.date_key)
            .await?;

        schedule::sort_slots_by_start(&mut slots);
        let Some(matched) = schedule::find_best_match(local.minutes, &slots, &weekly.subjects)
        else {
            return self.general_check_in(scan, local).await;
        };

        let class_key = matched.class_key();
        if day.contains_key(&class_key) {
            debug!(student_id = %scan.student_id, %class_key, "class already recorded today");
            return Ok(ScanOutcome::Duplicate { class_key });
        }

        day.insert(
            class_key.clone(),
            ClassAttendanceRecord {
                status: matched.status,
                time_in: local.clock.clone(),
                time_out: None,
                subject: matched.subject_label,
                time_slot: matched.time_slot,
                recorded_at: scan.timestamp_ms,
            },
        );
        self.attendance
            .put_day(&scan.student_id, &local.date_key, &day)
            .await?;

        Ok(ScanOutcome::Recorded {
            class_key,
            status: matched.status,
        })
    }

    /// Lenient fallback when no class resolves: the scan still lands as a
    /// present record so attendance is never silently dropped, keyed by the
    /// scan's wall-clock minute.
    async fn general_check_in(
        &self,
        scan: &ScanEvent,
        local: &LocalScanTime,
    ) -> anyhow::Result<ScanOutcome> {
        let class_key = format!("general_{}", local.clock);
        let mut day = self
            .attendance
            .get_day(&scan.student_id, &local.date_key)
            .await?;

        if day.contains_key(&class_key) {
            return Ok(ScanOutcome::Duplicate { class_key });
        }

        day.insert(
            class_key.clone(),
            ClassAttendanceRecord {
                status: AttendanceStatus::Present,
                time_in: local.clock.clone(),
                time_out: None,
                subject: "General Check-in".to_string(),
                time_slot: local.clock.clone(),
                recorded_at: scan.timestamp_ms,
            },
        );
        self.attendance
            .put_day(&scan.student_id, &local.date_key, &day)
            .await?;

        Ok(ScanOutcome::CheckedIn { class_key })
    }

    /// Process a batch of pending scans, tolerating per-scan failures so
    /// one poison scan cannot wedge a polling ingest loop. Failed scans are
    /// logged and left unprocessed for a later retry. Returns how many
    /// scans were handled.
    pub async fn process_all(&self, scans: &[ScanEvent]) -> usize {
        let mut processed = 0usize;
        for scan in scans {
            match self.process(scan).await {
                Ok(_) => processed += 1,
                Err(error) => {
                    warn!(
                        source_key = %scan.source_key,
                        student_id = %scan.student_id,
                        %error,
                        "failed to process scan; leaving it for retry"
                    );
                }
            }
        }
        processed
    }

    fn day_lock(&self, lock_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .day_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(lock_key.to_string()).or_default().clone()
    }

    /// Drop the map's entry once no other scan holds this lock. Both the
    /// map and the caller hold one reference each, so a strong count of two
    /// means the entry is idle.
    fn release_day_lock(&self, lock_key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .day_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&lock) == 2 {
            locks.remove(lock_key);
        }
    }
}
