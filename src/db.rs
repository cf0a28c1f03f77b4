use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{
    AbsenceAlert, AttendanceHistory, DayAttendanceRecord, Schedule, StudentProfile,
};
use crate::sources::{AlertStore, AttendanceStore, ScanMarker, ScheduleSource, StudentDirectory};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed implementation of every engine collaborator.
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleSource for PgBackend {
    async fn get_schedule(&self, student_id: &str) -> anyhow::Result<Option<Schedule>> {
        let row = sqlx::query("SELECT schedule FROM rfid_attendance.schedules WHERE student_id = $1")
            .bind(student_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let value: serde_json::Value = row.get("schedule");
                let schedule = serde_json::from_value(value)
                    .with_context(|| format!("malformed schedule for student {student_id}"))?;
                Ok(Some(schedule))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl AttendanceStore for PgBackend {
    async fn get_day(
        &self,
        student_id: &str,
        date_key: &str,
    ) -> anyhow::Result<DayAttendanceRecord> {
        let row = sqlx::query(
            "SELECT records FROM rfid_attendance.attendance_days \
             WHERE student_id = $1 AND date_key = $2",
        )
        .bind(student_id)
        .bind(date_key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let value: serde_json::Value = row.get("records");
                serde_json::from_value(value).with_context(|| {
                    format!("malformed day record for {student_id} on {date_key}")
                })
            }
            None => Ok(DayAttendanceRecord::new()),
        }
    }

    async fn put_day(
        &self,
        student_id: &str,
        date_key: &str,
        day: &DayAttendanceRecord,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rfid_attendance.attendance_days (student_id, date_key, records)
            VALUES ($1, $2, $3)
            ON CONFLICT (student_id, date_key) DO UPDATE
            SET records = EXCLUDED.records
            "#,
        )
        .bind(student_id)
        .bind(date_key)
        .bind(serde_json::to_value(day)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn all_days(&self, student_id: &str) -> anyhow::Result<AttendanceHistory> {
        let rows = sqlx::query(
            "SELECT date_key, records FROM rfid_attendance.attendance_days \
             WHERE student_id = $1",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;

        let mut history = BTreeMap::new();
        for row in rows {
            let date_key: String = row.get("date_key");
            let value: serde_json::Value = row.get("records");
            let day = serde_json::from_value(value)
                .with_context(|| format!("malformed day record for {student_id} on {date_key}"))?;
            history.insert(date_key, day);
        }
        Ok(history)
    }

    async fn student_ids_with_history(&self) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT student_id FROM rfid_attendance.attendance_days ORDER BY student_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("student_id")).collect())
    }
}

fn student_from_row(row: &sqlx::postgres::PgRow) -> StudentProfile {
    StudentProfile {
        id: row.get("id"),
        name: row.get("full_name"),
        parent_name: row.get("parent_name"),
        parent_email: row.get("parent_email"),
        rfid: row.get("rfid"),
    }
}

#[async_trait]
impl StudentDirectory for PgBackend {
    async fn get_student(&self, student_id: &str) -> anyhow::Result<Option<StudentProfile>> {
        let row = sqlx::query(
            "SELECT id, full_name, parent_name, parent_email, rfid \
             FROM rfid_attendance.students WHERE id = $1",
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(student_from_row))
    }

    async fn find_by_rfid(&self, rfid: &str) -> anyhow::Result<Option<StudentProfile>> {
        let row = sqlx::query(
            "SELECT id, full_name, parent_name, parent_email, rfid \
             FROM rfid_attendance.students WHERE rfid = $1",
        )
        .bind(rfid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(student_from_row))
    }
}

#[async_trait]
impl ScanMarker for PgBackend {
    async fn mark_processed(&self, source_key: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE rfid_attendance.scan_events SET processed = TRUE WHERE source_key = $1")
            .bind(source_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AlertStore for PgBackend {
    async fn get_alerts(&self, student_id: &str) -> anyhow::Result<Vec<AbsenceAlert>> {
        let rows = sqlx::query(
            "SELECT student_id, parent_email, alert_sent_at, total_absences_at_time, \
             absent_dates, email_sent \
             FROM rfid_attendance.absence_alerts \
             WHERE student_id = $1 ORDER BY alert_sent_at",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;

        let mut alerts = Vec::with_capacity(rows.len());
        for row in rows {
            let dates: serde_json::Value = row.get("absent_dates");
            alerts.push(AbsenceAlert {
                student_id: row.get("student_id"),
                parent_email: row.get("parent_email"),
                alert_sent_at: row.get("alert_sent_at"),
                total_absences_at_time: row.get::<i32, _>("total_absences_at_time") as u32,
                absent_dates: serde_json::from_value(dates)
                    .context("malformed absent_dates column")?,
                email_sent: row.get("email_sent"),
            });
        }
        Ok(alerts)
    }

    async fn append_alert(&self, alert: &AbsenceAlert) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rfid_attendance.absence_alerts
            (id, student_id, parent_email, alert_sent_at, total_absences_at_time,
             absent_dates, email_sent)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&alert.student_id)
        .bind(&alert.parent_email)
        .bind(alert.alert_sent_at)
        .bind(alert.total_absences_at_time as i32)
        .bind(serde_json::to_value(&alert.absent_dates)?)
        .bind(alert.email_sent)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Insert a scan row if its source key is new. Returns false when the scan
/// was already ingested.
pub async fn insert_scan(
    pool: &PgPool,
    source_key: &str,
    rfid: &str,
    timestamp_ms: i64,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO rfid_attendance.scan_events (source_key, rfid, timestamp_ms)
        VALUES ($1, $2, $3)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(source_key)
    .bind(rfid)
    .bind(timestamp_ms)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Oldest unprocessed scans, for the polling watch loop.
pub async fn fetch_unprocessed_scans(
    pool: &PgPool,
    limit: i64,
) -> anyhow::Result<Vec<(String, String, i64)>> {
    let rows = sqlx::query(
        "SELECT source_key, rfid, timestamp_ms FROM rfid_attendance.scan_events \
         WHERE processed = FALSE ORDER BY timestamp_ms LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            (
                row.get("source_key"),
                row.get("rfid"),
                row.get("timestamp_ms"),
            )
        })
        .collect())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let students = vec![
        (
            "stu-aurora",
            "Aurora Reyes",
            Some("Marisol Reyes"),
            Some("marisol.reyes@example.com"),
            "RFID-1001",
        ),
        (
            "stu-bastian",
            "Bastian Cruz",
            Some("Teodoro Cruz"),
            Some("teodoro.cruz@example.com"),
            "RFID-1002",
        ),
        // No parent contact on file; the alert pipeline skips this student.
        ("stu-celine", "Celine Uy", None, None, "RFID-1003"),
    ];

    for (id, name, parent_name, parent_email, rfid) in students {
        sqlx::query(
            r#"
            INSERT INTO rfid_attendance.students (id, full_name, parent_name, parent_email, rfid)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET full_name = EXCLUDED.full_name,
                parent_name = EXCLUDED.parent_name,
                parent_email = EXCLUDED.parent_email,
                rfid = EXCLUDED.rfid
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(parent_name)
        .bind(parent_email)
        .bind(rfid)
        .execute(pool)
        .await?;
    }

    let weekday_slots = json!([
        { "time_slot": "08:00-09:00", "subject_id": "cs101" },
        { "time_slot": "09:00-10:00", "subject_id": null },
        { "time_slot": "10:00-11:00", "subject_id": "math201" }
    ]);
    let schedule = json!({
        "days": {
            "monday": weekday_slots.clone(),
            "tuesday": weekday_slots.clone(),
            "wednesday": weekday_slots.clone(),
            "thursday": weekday_slots.clone(),
            "friday": weekday_slots
        },
        "subjects": {
            "cs101": { "code": "CS101", "name": "Intro to Computing" },
            "math201": { "code": "MATH201", "name": "Linear Algebra" }
        }
    });

    for student_id in ["stu-aurora", "stu-bastian"] {
        sqlx::query(
            r#"
            INSERT INTO rfid_attendance.schedules (student_id, schedule)
            VALUES ($1, $2)
            ON CONFLICT (student_id) DO UPDATE SET schedule = EXCLUDED.schedule
            "#,
        )
        .bind(student_id)
        .bind(&schedule)
        .execute(pool)
        .await?;
    }

    // A small backlog of unprocessed scans for the watch and import demos.
    let scans = vec![
        ("seed-scan-001", "RFID-1001", 1_772_439_000_000_i64), // 2026-03-02 08:10 UTC
        ("seed-scan-002", "RFID-1002", 1_772_440_800_000_i64), // 2026-03-02 08:40 UTC
        ("seed-scan-003", "RFID-1003", 1_772_442_000_000_i64), // 2026-03-02 09:00 UTC
    ];
    for (source_key, rfid, timestamp_ms) in scans {
        insert_scan(pool, source_key, rfid, timestamp_ms).await?;
    }

    Ok(())
}
