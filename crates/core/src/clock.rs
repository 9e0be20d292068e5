//! Time helpers: owner locales, active-hours windows, deadlines, durations.

use std::time::Duration;

use chrono::{
    DateTime, Datelike, Days, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, Timelike,
    Utc, Weekday,
};

use crate::error::CoreError;

/// Layout of the configured deadline (`DEADLINE` + `CUTOFF_TIME`).
pub const DEADLINE_FORMAT: &str = "%m-%d-%Y %H:%M";

/// A fixed-offset timezone from seconds east of UTC. Out-of-range offsets
/// collapse to UTC.
pub fn fixed_offset(offset_secs: i32) -> FixedOffset {
    FixedOffset::east_opt(offset_secs).unwrap_or_else(|| Utc.fix())
}

/// `now` seen from a locale `offset_secs` east of UTC.
pub fn local_time(now: DateTime<Utc>, offset_secs: i32) -> DateTime<FixedOffset> {
    now.with_timezone(&fixed_offset(offset_secs))
}

/// Parse the configured deadline date and cutoff time as a UTC instant.
pub fn parse_deadline(date: &str, cutoff: &str) -> Result<DateTime<Utc>, CoreError> {
    let joined = format!("{} {}", date.trim(), cutoff.trim());
    NaiveDateTime::parse_from_str(&joined, DEADLINE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| CoreError::DateTime {
            input: joined,
            reason: e.to_string(),
        })
}

/// Parse an `HH:MM` wall-clock time.
pub fn parse_hhmm(s: &str) -> Result<NaiveTime, CoreError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|e| CoreError::DateTime {
        input: s.to_string(),
        reason: e.to_string(),
    })
}

/// An inclusive daily window at minute resolution. A start later than the
/// end wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ActiveWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start: truncate_minute(start),
            end: truncate_minute(end),
        }
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, CoreError> {
        Ok(Self::new(parse_hhmm(start)?, parse_hhmm(end)?))
    }

    pub fn contains(&self, at: NaiveTime) -> bool {
        let t = truncate_minute(at);
        if self.start < self.end {
            self.start <= t && t <= self.end
        } else if self.start == self.end {
            t == self.start
        } else {
            t >= self.start || t <= self.end
        }
    }

    /// Whether `now` falls inside the window in the given locale.
    pub fn contains_local(&self, now: DateTime<Utc>, offset_secs: i32) -> bool {
        self.contains(local_time(now, offset_secs).time())
    }
}

fn truncate_minute(t: NaiveTime) -> NaiveTime {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// The next date falling on `weekday`, counting `from` itself.
pub fn next_weekday(from: NaiveDate, weekday: Weekday) -> NaiveDate {
    let ahead = (7 + weekday.num_days_from_monday() - from.weekday().num_days_from_monday()) % 7;
    from.checked_add_days(Days::new(u64::from(ahead)))
        .unwrap_or(from)
}

/// English possessive: `Frodo` → `Frodo's`, `James` → `James'`.
pub fn possessive(name: &str) -> String {
    let name = name.trim();
    if name.ends_with('s') || name.ends_with('S') {
        format!("{name}'")
    } else {
        format!("{name}'s")
    }
}

/// Parse a human-readable duration string into a [`Duration`].
///
/// Supports components: `Xd` (days), `Xh` (hours), `Xm` (minutes), `Xs` (seconds).
/// Components can be combined: "2h30m", "1d12h", "90s". A bare number is
/// seconds. Returns `None` if the string is empty or unparseable.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let mut total_secs: u64 = 0;
    let mut num_buf = String::new();
    let mut found_unit = false;

    for ch in s.chars() {
        if ch.is_ascii_digit() {
            num_buf.push(ch);
        } else {
            let n: u64 = num_buf.parse().ok()?;
            num_buf.clear();
            let unit = match ch {
                'd' => 86_400,
                'h' => 3_600,
                'm' => 60,
                's' => 1,
                _ => return None,
            };
            total_secs = total_secs.checked_add(n.checked_mul(unit)?)?;
            found_unit = true;
        }
    }

    if !num_buf.is_empty() {
        // "30m15" is ambiguous.
        if found_unit {
            return None;
        }
        total_secs = num_buf.parse().ok()?;
    }

    if total_secs == 0 && !found_unit {
        return None;
    }

    Some(Duration::from_secs(total_secs))
}
