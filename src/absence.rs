use crate::models::{AttendanceHistory, AttendanceStatus};

/// Absence totals for one student across their whole attendance history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbsenceSummary {
    /// One per absent class record; a day with two absent classes adds 2.
    pub count: u32,
    /// Each date at most once, ascending. A day with two absent classes
    /// still appears once here.
    pub dates: Vec<String>,
}

/// Count absences across a student's history. The count is per absent
/// class record while the date list is per day with at least one absence;
/// downstream alerting depends on that asymmetry.
pub fn count_absences(history: &AttendanceHistory) -> AbsenceSummary {
    let mut summary = AbsenceSummary::default();

    for (date_key, day) in history {
        let absent_classes = day
            .values()
            .filter(|record| record.status == AttendanceStatus::Absent)
            .count() as u32;
        if absent_classes > 0 {
            summary.count += absent_classes;
            summary.dates.push(date_key.clone());
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClassAttendanceRecord, DayAttendanceRecord};
    use std::collections::BTreeMap;

    fn record(status: AttendanceStatus) -> ClassAttendanceRecord {
        ClassAttendanceRecord {
            status,
            time_in: "08:10".to_string(),
            time_out: None,
            subject: "CS101 - Intro to Computing".to_string(),
            time_slot: "08:00-09:00".to_string(),
            recorded_at: 0,
        }
    }

    fn day(statuses: &[AttendanceStatus]) -> DayAttendanceRecord {
        statuses
            .iter()
            .enumerate()
            .map(|(i, status)| (format!("class-{i}"), record(*status)))
            .collect()
    }

    #[test]
    fn empty_history_counts_nothing() {
        let summary = count_absences(&BTreeMap::new());
        assert_eq!(summary, AbsenceSummary::default());
    }

    #[test]
    fn counts_per_class_but_dates_per_day() {
        let mut history = AttendanceHistory::new();
        history.insert(
            "2026-03-02".to_string(),
            day(&[AttendanceStatus::Absent, AttendanceStatus::Absent]),
        );
        history.insert(
            "2026-03-03".to_string(),
            day(&[AttendanceStatus::Present, AttendanceStatus::Absent]),
        );

        let summary = count_absences(&history);
        assert_eq!(summary.count, 3);
        assert_eq!(summary.dates, vec!["2026-03-02", "2026-03-03"]);
    }

    #[test]
    fn days_without_absences_are_skipped() {
        let mut history = AttendanceHistory::new();
        history.insert(
            "2026-03-02".to_string(),
            day(&[AttendanceStatus::Present, AttendanceStatus::Late]),
        );
        history.insert("2026-03-04".to_string(), day(&[AttendanceStatus::Absent]));

        let summary = count_absences(&history);
        assert_eq!(summary.count, 1);
        assert_eq!(summary.dates, vec!["2026-03-04"]);
    }

    #[test]
    fn dates_come_out_sorted() {
        let mut history = AttendanceHistory::new();
        history.insert("2026-03-09".to_string(), day(&[AttendanceStatus::Absent]));
        history.insert("2026-03-02".to_string(), day(&[AttendanceStatus::Absent]));

        let summary = count_absences(&history);
        assert_eq!(summary.dates, vec!["2026-03-02", "2026-03-09"]);
    }
}
