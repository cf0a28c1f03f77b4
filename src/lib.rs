//! RFID attendance-matching and absence-alerting engine.
//!
//! Raw scan timestamps are matched against weekly class schedules to produce
//! per-class attendance records (present/late/absent), persisted idempotently
//! per (student, date, classKey). Absent records feed a debounced alert
//! pipeline that notifies parents once a student's absence count crosses a
//! threshold, at most once per count.

pub mod absence;
pub mod db;
pub mod models;
pub mod pipeline;
pub mod processor;
pub mod schedule;
pub mod sources;
