//! In-memory collaborator implementations shared by the integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use rfid_attendance_engine::models::{
    AbsenceAlert, AlertRequest, AttendanceHistory, DayAttendanceRecord, Schedule, ScheduleSlot,
    StudentProfile, Subject,
};
use rfid_attendance_engine::sources::{
    AlertSender, AlertStore, AttendanceStore, ScanMarker, ScheduleSource, StudentDirectory,
};

#[derive(Default)]
pub struct MemoryBackend {
    pub schedules: Mutex<HashMap<String, Schedule>>,
    pub attendance: Mutex<HashMap<String, AttendanceHistory>>,
    pub students: Mutex<HashMap<String, StudentProfile>>,
    pub alerts: Mutex<Vec<AbsenceAlert>>,
    pub processed_scans: Mutex<Vec<String>>,
}

impl MemoryBackend {
    pub fn add_student(&self, profile: StudentProfile) {
        self.students
            .lock()
            .unwrap()
            .insert(profile.id.clone(), profile);
    }

    pub fn add_schedule(&self, student_id: &str, schedule: Schedule) {
        self.schedules
            .lock()
            .unwrap()
            .insert(student_id.to_string(), schedule);
    }

    pub fn day(&self, student_id: &str, date_key: &str) -> DayAttendanceRecord {
        self.attendance
            .lock()
            .unwrap()
            .get(student_id)
            .and_then(|history| history.get(date_key))
            .cloned()
            .unwrap_or_default()
    }

    pub fn alerts_for(&self, student_id: &str) -> Vec<AbsenceAlert> {
        self.alerts
            .lock()
            .unwrap()
            .iter()
            .filter(|alert| alert.student_id == student_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ScheduleSource for MemoryBackend {
    async fn get_schedule(&self, student_id: &str) -> anyhow::Result<Option<Schedule>> {
        Ok(self.schedules.lock().unwrap().get(student_id).cloned())
    }
}

#[async_trait]
impl AttendanceStore for MemoryBackend {
    async fn get_day(
        &self,
        student_id: &str,
        date_key: &str,
    ) -> anyhow::Result<DayAttendanceRecord> {
        Ok(self.day(student_id, date_key))
    }

    async fn put_day(
        &self,
        student_id: &str,
        date_key: &str,
        day: &DayAttendanceRecord,
    ) -> anyhow::Result<()> {
        self.attendance
            .lock()
            .unwrap()
            .entry(student_id.to_string())
            .or_default()
            .insert(date_key.to_string(), day.clone());
        Ok(())
    }

    async fn all_days(&self, student_id: &str) -> anyhow::Result<AttendanceHistory> {
        Ok(self
            .attendance
            .lock()
            .unwrap()
            .get(student_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn student_ids_with_history(&self) -> anyhow::Result<Vec<String>> {
        let mut ids: Vec<String> = self.attendance.lock().unwrap().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl StudentDirectory for MemoryBackend {
    async fn get_student(&self, student_id: &str) -> anyhow::Result<Option<StudentProfile>> {
        Ok(self.students.lock().unwrap().get(student_id).cloned())
    }

    async fn find_by_rfid(&self, rfid: &str) -> anyhow::Result<Option<StudentProfile>> {
        Ok(self
            .students
            .lock()
            .unwrap()
            .values()
            .find(|profile| profile.rfid == rfid)
            .cloned())
    }
}

#[async_trait]
impl ScanMarker for MemoryBackend {
    async fn mark_processed(&self, source_key: &str) -> anyhow::Result<()> {
        self.processed_scans
            .lock()
            .unwrap()
            .push(source_key.to_string());
        Ok(())
    }
}

#[async_trait]
impl AlertStore for MemoryBackend {
    async fn get_alerts(&self, student_id: &str) -> anyhow::Result<Vec<AbsenceAlert>> {
        Ok(self.alerts_for(student_id))
    }

    async fn append_alert(&self, alert: &AbsenceAlert) -> anyhow::Result<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Sender that records every request and answers from a scripted queue of
/// outcomes (defaulting to success once the script runs out).
#[derive(Default)]
pub struct RecordingSender {
    pub requests: Mutex<Vec<AlertRequest>>,
    pub scripted: Mutex<Vec<anyhow::Result<bool>>>,
    pub calls: AtomicUsize,
}

impl RecordingSender {
    pub fn failing_once() -> Self {
        let sender = Self::default();
        sender
            .scripted
            .lock()
            .unwrap()
            .push(Err(anyhow::anyhow!("smtp unavailable")));
        sender
    }

    pub fn sent(&self) -> Vec<AlertRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSender for RecordingSender {
    async fn send_absence_alert(&self, request: &AlertRequest) -> anyhow::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let mut scripted = self.scripted.lock().unwrap();
        if scripted.is_empty() {
            Ok(true)
        } else {
            scripted.remove(0)
        }
    }
}

/// Sender that parks inside the delivery call until the test releases it,
/// so overlap guards can be exercised deterministically.
#[derive(Default)]
pub struct GatedSender {
    pub entered: tokio::sync::Notify,
    pub release: tokio::sync::Notify,
    pub calls: AtomicUsize,
}

#[async_trait]
impl AlertSender for GatedSender {
    async fn send_absence_alert(&self, _request: &AlertRequest) -> anyhow::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        Ok(true)
    }
}

/// A weekly schedule with one Monday 08:00-09:00 CS101 slot plus an
/// unassigned slot, mirroring the common classroom setup.
pub fn monday_cs101_schedule() -> Schedule {
    let mut days = HashMap::new();
    days.insert(
        "monday".to_string(),
        vec![
            ScheduleSlot {
                time_slot: "08:00-09:00".to_string(),
                subject_id: Some("cs101".to_string()),
            },
            ScheduleSlot {
                time_slot: "09:00-10:00".to_string(),
                subject_id: None,
            },
        ],
    );

    let mut subjects = HashMap::new();
    subjects.insert(
        "cs101".to_string(),
        Subject {
            code: "CS101".to_string(),
            name: "Intro to Computing".to_string(),
        },
    );

    Schedule { days, subjects }
}

pub fn student(id: &str, parent_email: Option<&str>) -> StudentProfile {
    StudentProfile {
        id: id.to_string(),
        name: format!("Student {id}"),
        parent_name: Some("Alex Rivera".to_string()),
        parent_email: parent_email.map(str::to_string),
        rfid: format!("RFID-{id}"),
    }
}
