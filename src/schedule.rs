use std::collections::HashMap;

use anyhow::{bail, Context};
use chrono::{Datelike, FixedOffset, TimeZone, Timelike, Utc, Weekday};

use crate::models::{AttendanceStatus, ScheduleSlot, Subject};

/// Scans up to this many minutes before class start count as present.
pub const GRACE_MINUTES: i64 = 15;
/// Scans up to this many minutes after class start count as present.
pub const LATE_THRESHOLD_MINUTES: i64 = 15;
/// Scans up to this many minutes after class start count as late; beyond
/// that (or before the grace window) the class is marked absent.
pub const ABSENT_THRESHOLD_MINUTES: i64 = 30;

/// Classify a scan against a class's time window. All arguments are minutes
/// since local midnight. The end minute is part of the slot contract but
/// plays no role in the boundary math; only the matcher's priority scoring
/// looks at it.
pub fn classify(scan_minutes: i64, start_minutes: i64, _end_minutes: i64) -> AttendanceStatus {
    let grace_start = start_minutes - GRACE_MINUTES;
    let late_threshold = start_minutes + LATE_THRESHOLD_MINUTES;
    let absent_threshold = start_minutes + ABSENT_THRESHOLD_MINUTES;

    if scan_minutes >= grace_start && scan_minutes <= late_threshold {
        AttendanceStatus::Present
    } else if scan_minutes > late_threshold && scan_minutes <= absent_threshold {
        AttendanceStatus::Late
    } else {
        AttendanceStatus::Absent
    }
}

/// Parse `"HH:MM"` into minutes since midnight.
pub fn parse_clock(clock: &str) -> anyhow::Result<i64> {
    let (hours, minutes) = clock
        .split_once(':')
        .with_context(|| format!("clock time must be HH:MM, got {clock:?}"))?;
    let hours: i64 = hours
        .parse()
        .with_context(|| format!("invalid hour in {clock:?}"))?;
    let minutes: i64 = minutes
        .parse()
        .with_context(|| format!("invalid minute in {clock:?}"))?;
    if !(0..24).contains(&hours) || !(0..60).contains(&minutes) {
        bail!("clock time out of range: {clock:?}");
    }
    Ok(hours * 60 + minutes)
}

/// Parse `"HH:MM-HH:MM"` into (start, end) minutes. Start must precede end.
pub fn parse_time_slot(time_slot: &str) -> anyhow::Result<(i64, i64)> {
    let (start, end) = time_slot
        .split_once('-')
        .with_context(|| format!("time slot must be HH:MM-HH:MM, got {time_slot:?}"))?;
    let start = parse_clock(start)?;
    let end = parse_clock(end)?;
    if start >= end {
        bail!("time slot start must precede end: {time_slot:?}");
    }
    Ok((start, end))
}

/// The slot selected for a scan, with its classified status and resolved
/// display subject.
#[derive(Debug, Clone)]
pub struct SlotMatch {
    pub time_slot: String,
    pub subject_id: String,
    pub subject_label: String,
    pub status: AttendanceStatus,
}

impl SlotMatch {
    /// Deterministic key disambiguating classes within one student-day.
    pub fn class_key(&self) -> String {
        format!("{}_{}", self.time_slot, self.subject_id)
    }
}

/// Pick the best slot for a scan among a day's slots.
///
/// Slots without a subject are skipped. A slot is a candidate when the scan
/// falls within `[start - 15, start + 30]` or anywhere inside the live class
/// period, so a very late scan during class still lands on that class (and
/// classifies as absent) rather than as a general check-in. Candidates score
/// 3 inside the live period, 2 in the grace window before start, and 1
/// otherwise; the highest score wins and ties keep the first candidate in
/// the supplied order, so callers pass slots sorted ascending by start.
pub fn find_best_match(
    scan_minutes: i64,
    slots: &[ScheduleSlot],
    subjects: &HashMap<String, Subject>,
) -> Option<SlotMatch> {
    let mut best: Option<(u8, &ScheduleSlot, i64, i64, &str)> = None;

    for slot in slots {
        let Some(subject_id) = slot.subject_id.as_deref() else {
            continue;
        };
        let Ok((start, end)) = parse_time_slot(&slot.time_slot) else {
            continue;
        };
        let window_end = (start + ABSENT_THRESHOLD_MINUTES).max(end);
        if scan_minutes < start - GRACE_MINUTES || scan_minutes > window_end {
            continue;
        }

        let priority = if scan_minutes >= start && scan_minutes <= end {
            3
        } else if scan_minutes < start {
            2
        } else {
            1
        };

        match best {
            Some((current, ..)) if current >= priority => {}
            _ => best = Some((priority, slot, start, end, subject_id)),
        }
    }

    best.map(|(_, slot, start, end, subject_id)| {
        let subject_label = subjects
            .get(subject_id)
            .map(|subject| format!("{} - {}", subject.code, subject.name))
            .unwrap_or_else(|| subject_id.to_string());
        SlotMatch {
            time_slot: slot.time_slot.clone(),
            subject_id: subject_id.to_string(),
            subject_label,
            status: classify(scan_minutes, start, end),
        }
    })
}

/// Sort a day's slots ascending by start time. Slots that fail to parse
/// sort last; the matcher skips them anyway.
pub fn sort_slots_by_start(slots: &mut [ScheduleSlot]) {
    slots.sort_by_key(|slot| {
        parse_time_slot(&slot.time_slot)
            .map(|(start, _)| start)
            .unwrap_or(i64::MAX)
    });
}

/// A scan timestamp resolved into the engine's local calendar.
#[derive(Debug, Clone)]
pub struct LocalScanTime {
    /// Lowercase weekday name, matching schedule day keys.
    pub day_of_week: String,
    /// `"HH:MM"` wall-clock time of the scan.
    pub clock: String,
    /// `"YYYY-MM-DD"` date key.
    pub date_key: String,
    /// Minutes since local midnight.
    pub minutes: i64,
}

/// Resolve an epoch-milliseconds timestamp against the deployment's fixed
/// UTC offset.
pub fn resolve_scan_time(timestamp_ms: i64, offset: FixedOffset) -> anyhow::Result<LocalScanTime> {
    let instant = Utc
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .with_context(|| format!("timestamp out of range: {timestamp_ms}"))?;
    let local = instant.with_timezone(&offset);

    let day_of_week = match local.weekday() {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    };

    Ok(LocalScanTime {
        day_of_week: day_of_week.to_string(),
        clock: local.format("%H:%M").to_string(),
        date_key: local.format("%Y-%m-%d").to_string(),
        minutes: i64::from(local.hour()) * 60 + i64::from(local.minute()),
    })
}
