use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Subject catalog entry referenced by schedule slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub code: String,
    pub name: String,
}

/// One scheduled class period on one weekday.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSlot {
    /// `"HH:MM-HH:MM"`, 24-hour, start strictly before end.
    pub time_slot: String,
    /// `None` means an empty slot with no class assigned.
    #[serde(default)]
    pub subject_id: Option<String>,
}

/// Weekly schedule owned by one student. Day keys are lowercase weekday
/// names ("monday" .. "sunday").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub days: HashMap<String, Vec<ScheduleSlot>>,
    #[serde(default)]
    pub subjects: HashMap<String, Subject>,
}

impl Schedule {
    pub fn slots_for(&self, day_of_week: &str) -> &[ScheduleSlot] {
        self.days.get(day_of_week).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
}

/// Attendance outcome for one class on one day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassAttendanceRecord {
    pub status: AttendanceStatus,
    /// Local wall-clock time of the scan, `"HH:MM"`.
    pub time_in: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_out: Option<String>,
    /// Display label, `"<code> - <name>"` or the raw subject id.
    pub subject: String,
    /// Matched slot's `"HH:MM-HH:MM"`, or the scan clock for general check-ins.
    pub time_slot: String,
    /// Original scan timestamp, epoch milliseconds.
    pub recorded_at: i64,
}

/// All class records for one student on one calendar date, keyed by classKey.
/// At most one record per classKey; BTreeMap keeps iteration deterministic.
pub type DayAttendanceRecord = BTreeMap<String, ClassAttendanceRecord>;

/// Full attendance history for one student: dateKey -> day record.
pub type AttendanceHistory = BTreeMap<String, DayAttendanceRecord>;

/// A single RFID read attributed to a student. `source_key` identifies the
/// originating scan row for the processed marker.
#[derive(Debug, Clone)]
pub struct ScanEvent {
    pub student_id: String,
    pub rfid: String,
    pub timestamp_ms: i64,
    pub source_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentProfile {
    pub id: String,
    pub name: String,
    pub parent_name: Option<String>,
    pub parent_email: Option<String>,
    pub rfid: String,
}

/// One absence-alert history entry. A pending entry (`email_sent = false`)
/// is written before delivery is attempted; a confirmed entry follows on
/// success. Suppression only ever keys off confirmed entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbsenceAlert {
    pub student_id: String,
    pub parent_email: String,
    pub alert_sent_at: i64,
    pub total_absences_at_time: u32,
    pub absent_dates: Vec<String>,
    pub email_sent: bool,
}

/// Payload handed to the external notification sender.
#[derive(Debug, Clone)]
pub struct AlertRequest {
    pub parent_email: String,
    pub parent_name: String,
    pub student_name: String,
    pub student_id: String,
    pub absent_dates: Vec<String>,
    pub total_absences: u32,
}
