//! Collaborator interfaces the engine depends on. Production deployments
//! back all of them with Postgres (`crate::db::PgBackend`); tests substitute
//! in-memory implementations.

use async_trait::async_trait;
use tracing::info;

use crate::models::{
    AbsenceAlert, AlertRequest, AttendanceHistory, DayAttendanceRecord, Schedule, StudentProfile,
};

/// Read-only view of student schedules, maintained elsewhere.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    async fn get_schedule(&self, student_id: &str) -> anyhow::Result<Option<Schedule>>;
}

/// Attendance record persistence. Day records are read and written as whole
/// maps; there are deliberately no field-level update operations, so the
/// processor's read-modify-write cannot drop sibling class records.
#[async_trait]
pub trait AttendanceStore: Send + Sync {
    async fn get_day(&self, student_id: &str, date_key: &str)
        -> anyhow::Result<DayAttendanceRecord>;

    async fn put_day(
        &self,
        student_id: &str,
        date_key: &str,
        day: &DayAttendanceRecord,
    ) -> anyhow::Result<()>;

    async fn all_days(&self, student_id: &str) -> anyhow::Result<AttendanceHistory>;

    /// Students with at least one stored day record; the alert batch
    /// iterates exactly this set.
    async fn student_ids_with_history(&self) -> anyhow::Result<Vec<String>>;
}

#[async_trait]
pub trait StudentDirectory: Send + Sync {
    async fn get_student(&self, student_id: &str) -> anyhow::Result<Option<StudentProfile>>;

    async fn find_by_rfid(&self, rfid: &str) -> anyhow::Result<Option<StudentProfile>>;
}

/// Marks the originating scan row processed once the engine has handled it,
/// whichever branch it took.
#[async_trait]
pub trait ScanMarker: Send + Sync {
    async fn mark_processed(&self, source_key: &str) -> anyhow::Result<()>;
}

/// Append-only absence-alert history.
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn get_alerts(&self, student_id: &str) -> anyhow::Result<Vec<AbsenceAlert>>;

    async fn append_alert(&self, alert: &AbsenceAlert) -> anyhow::Result<()>;
}

/// Outbound parent notification. Returns whether delivery succeeded;
/// transport errors surface as `Err`.
#[async_trait]
pub trait AlertSender: Send + Sync {
    async fn send_absence_alert(&self, request: &AlertRequest) -> anyhow::Result<bool>;
}

/// Sender that records deliveries in the log only. Stands in for the real
/// mail collaborator in CLI deployments that have none configured.
pub struct LogAlertSender;

#[async_trait]
impl AlertSender for LogAlertSender {
    async fn send_absence_alert(&self, request: &AlertRequest) -> anyhow::Result<bool> {
        info!(
            student_id = %request.student_id,
            parent_email = %request.parent_email,
            total_absences = request.total_absences,
            dates = ?request.absent_dates,
            "absence alert (log-only sender)"
        );
        Ok(true)
    }
}
