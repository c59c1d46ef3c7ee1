//! Which calendar days a staff member may still submit a bunk log for.
//!
//! Everything here works on calendar days. "Today" is the local calendar day,
//! taken once per decision, so a log written just before midnight is never
//! judged against the UTC date.

use chrono::{Local, NaiveDate};

use crate::auth::Role;

/// How far back non-admin staff may backfill logs
pub const SUBMISSION_LOOKBACK_DAYS: i64 = 30;

/// Day format used by the API and the date pickers
const DAY_FORMAT: &str = "%Y-%m-%d";

/// The local calendar day.
pub fn local_today() -> NaiveDate {
    Local::now().date_naive()
}

/// Parse a `YYYY-MM-DD` day. A full timestamp keeps the date it was written
/// with; no timezone conversion happens.
pub fn parse_day(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    let day = value.get(..10)?;
    if value.len() > 10 && !value[10..].starts_with(['T', ' ']) {
        return None;
    }
    NaiveDate::parse_from_str(day, DAY_FORMAT).ok()
}

pub fn format_day(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

/// Oldest day `role` may still submit for, `None` when unbounded.
pub fn earliest_submission_day(today: NaiveDate, role: Role) -> Option<NaiveDate> {
    match role {
        Role::Admin => None,
        Role::UnitHead | Role::CamperCare | Role::Counselor => {
            today.checked_sub_signed(chrono::Duration::days(SUBMISSION_LOOKBACK_DAYS))
        }
    }
}

/// Logs may be written for today or a past day inside the role's lookback,
/// never for a future day.
pub fn is_within_submission_window(date: NaiveDate, today: NaiveDate, role: Role) -> bool {
    if date > today {
        return false;
    }
    match earliest_submission_day(today, role) {
        Some(earliest) => date >= earliest,
        None => true,
    }
}
