//! Wall-clock helpers: Unix seconds and UTC formatting without a date crate.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as Unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Format Unix seconds as a compact ISO-8601 timestamp for file names.
/// Example: `2026-02-15T013000Z`
pub fn format_iso8601_compact(secs: i64) -> String {
    let (year, month, day, hour, min, sec) = secs_to_utc(secs.max(0) as u64);
    format!(
        "{:04}-{:02}-{:02}T{:02}{:02}{:02}Z",
        year, month, day, hour, min, sec
    )
}

/// Format Unix seconds as a full ISO-8601 timestamp.
/// Example: `2026-02-15T01:30:00Z`
pub fn format_iso8601(secs: i64) -> String {
    let (year, month, day, hour, min, sec) = secs_to_utc(secs.max(0) as u64);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year, month, day, hour, min, sec
    )
}

/// Parse a compact timestamp produced by [`format_iso8601_compact`] back into
/// Unix seconds.
pub fn parse_iso8601_compact(s: &str) -> Option<i64> {
    let b = s.as_bytes();
    if b.len() != 18 || b[4] != b'-' || b[7] != b'-' || b[10] != b'T' || b[17] != b'Z' {
        return None;
    }
    let num = |r: std::ops::Range<usize>| s.get(r)?.parse::<u64>().ok();
    let (year, month, day) = (num(0..4)?, num(5..7)?, num(8..10)?);
    let (hour, min, sec) = (num(11..13)?, num(13..15)?, num(15..17)?);
    if !(1..=12).contains(&month) || day == 0 || hour > 23 || min > 59 || sec > 59 {
        return None;
    }

    let mut days = 0u64;
    for y in 1970..year {
        days += if is_leap(y) { 366 } else { 365 };
    }
    let months_days = month_lengths(year);
    for md in months_days.iter().take(month as usize - 1) {
        days += md;
    }
    if day > months_days[month as usize - 1] {
        return None;
    }
    days += day - 1;
    Some((days * 86400 + hour * 3600 + min * 60 + sec) as i64)
}

/// Convert seconds since Unix epoch to (year, month, day, hour, minute, second) UTC.
/// No leap second handling.
fn secs_to_utc(secs: u64) -> (u64, u64, u64, u64, u64, u64) {
    let sec = secs % 60;
    let min = (secs / 60) % 60;
    let hour = (secs / 3600) % 24;

    let mut days = secs / 86400;
    let mut year = 1970u64;

    loop {
        let days_in_year = if is_leap(year) { 366 } else { 365 };
        if days < days_in_year {
            break;
        }
        days -= days_in_year;
        year += 1;
    }

    let mut month = 0u64;
    for (i, &md) in month_lengths(year).iter().enumerate() {
        if days < md {
            month = i as u64 + 1;
            break;
        }
        days -= md;
    }
    let day = days + 1;

    (year, month, day, hour, min, sec)
}

fn month_lengths(year: u64) -> [u64; 12] {
    if is_leap(year) {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    }
}

fn is_leap(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}
