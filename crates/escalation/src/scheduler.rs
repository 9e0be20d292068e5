//! Per-bucket cron dispatch with cooldown support.
//!
//! Each interval bucket has one dispatch entry: a cron expression and an
//! optional cooldown. [`BucketScheduler`] tracks when each bucket last fired
//! and reports which buckets are due on a poll tick.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tracing::{debug, warn};

use crate::bucket::BucketKey;

/// Scheduling state for one bucket.
#[derive(Debug, Clone)]
pub struct DispatchEntry {
    pub key: BucketKey,
    /// 6-field cron expression (seconds first).
    pub cron_expression: String,
    /// Minimum interval between successive triggers.
    pub cooldown: Option<Duration>,
    pub last_triggered: Option<DateTime<Utc>>,
}

pub struct BucketScheduler {
    entries: HashMap<BucketKey, DispatchEntry>,
}

impl BucketScheduler {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register (or replace) a bucket's dispatch entry. The first trigger is
    /// the first cron tick after `now`.
    pub fn register(
        &mut self,
        key: BucketKey,
        cron_expression: impl Into<String>,
        cooldown: Option<Duration>,
        now: DateTime<Utc>,
    ) {
        self.entries.insert(
            key,
            DispatchEntry {
                key,
                cron_expression: cron_expression.into(),
                cooldown,
                last_triggered: Some(now),
            },
        );
    }

    /// One entry per bucket; the default bucket runs at `default_minutes`.
    pub fn register_buckets(&mut self, default_minutes: u32, now: DateTime<Utc>) {
        for key in BucketKey::ALL {
            let (cron, cooldown) = cron_for_minutes(key.minutes(default_minutes));
            self.register(key, cron, cooldown, now);
        }
    }

    /// Whether a bucket should fire at `now`.
    ///
    /// `false` if the bucket is unknown, its cron expression is invalid, the
    /// cron tick has not arrived, or the cooldown has not elapsed.
    pub fn should_run(&self, key: BucketKey, now: DateTime<Utc>) -> bool {
        let Some(entry) = self.entries.get(&key) else {
            return false;
        };

        if let (Some(cooldown), Some(last)) = (entry.cooldown, entry.last_triggered) {
            let elapsed = now.signed_duration_since(last);
            if elapsed < chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::zero()) {
                debug!(bucket = %key, "bucket still in cooldown");
                return false;
            }
        }

        match Schedule::from_str(&entry.cron_expression) {
            Ok(schedule) => is_cron_due(&schedule, now, entry.last_triggered),
            Err(e) => {
                warn!(
                    bucket = %key,
                    cron = %entry.cron_expression,
                    error = %e,
                    "invalid cron expression"
                );
                false
            }
        }
    }

    pub fn record_trigger_at(&mut self, key: BucketKey, at: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.last_triggered = Some(at);
        }
    }

    /// Buckets due at `now`, in cadence order.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<BucketKey> {
        let mut due: Vec<BucketKey> = self
            .entries
            .keys()
            .copied()
            .filter(|key| self.should_run(*key, now))
            .collect();
        due.sort();
        due
    }

    pub fn get(&self, key: BucketKey) -> Option<&DispatchEntry> {
        self.entries.get(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for BucketScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Cron expression (and cooldown, when cron cannot express the cadence) for
/// a reminder cadence in minutes.
///
/// Cadences dividing an hour or a day map onto a plain expression. Anything
/// else ticks every minute and relies on the cooldown.
pub fn cron_for_minutes(minutes: u32) -> (String, Option<Duration>) {
    let minutes = minutes.max(1);
    if minutes < 60 && 60 % minutes == 0 {
        return (format!("0 */{minutes} * * * *"), None);
    }
    if minutes % 60 == 0 {
        let hours = minutes / 60;
        if hours == 1 {
            return ("0 0 * * * *".to_string(), None);
        }
        if 24 % hours == 0 {
            return (format!("0 0 */{hours} * * *"), None);
        }
    }
    (
        "0 * * * * *".to_string(),
        Some(Duration::from_secs(u64::from(minutes) * 60)),
    )
}

/// A bucket is due if a cron tick falls after `last_run` (exclusive) and at
/// or before `now`. Without a `last_run`, any tick in the last day counts.
fn is_cron_due(schedule: &Schedule, now: DateTime<Utc>, last_run: Option<DateTime<Utc>>) -> bool {
    let check_from = last_run.unwrap_or(now - chrono::Duration::days(1));
    schedule
        .after(&check_from)
        .next()
        .is_some_and(|next| next <= now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn fixed_cadences_map_to_plain_cron() {
        assert_eq!(cron_for_minutes(30), ("0 */30 * * * *".into(), None));
        assert_eq!(cron_for_minutes(60), ("0 0 * * * *".into(), None));
        assert_eq!(cron_for_minutes(120), ("0 0 */2 * * *".into(), None));
        assert_eq!(cron_for_minutes(240), ("0 0 */4 * * *".into(), None));
        assert_eq!(cron_for_minutes(15), ("0 */15 * * * *".into(), None));
    }

    #[test]
    fn odd_cadence_falls_back_to_cooldown() {
        let (cron, cooldown) = cron_for_minutes(90);
        assert_eq!(cron, "0 * * * * *");
        assert_eq!(cooldown, Some(Duration::from_secs(90 * 60)));

        let (_, cooldown) = cron_for_minutes(420);
        assert_eq!(cooldown, Some(Duration::from_secs(420 * 60)));
    }

    #[test]
    fn shipped_expressions_parse() {
        for minutes in [30, 60, 120, 240, 45, 90] {
            let (cron, _) = cron_for_minutes(minutes);
            assert!(Schedule::from_str(&cron).is_ok(), "{cron}");
        }
    }

    #[test]
    fn registered_bucket_waits_for_next_tick() {
        let mut sched = BucketScheduler::new();
        sched.register_buckets(60, ts("2024-03-06T10:05:00Z"));
        assert_eq!(sched.len(), 5);

        assert!(sched.due(ts("2024-03-06T10:20:00Z")).is_empty());
        assert_eq!(
            sched.due(ts("2024-03-06T10:30:00Z")),
            vec![BucketKey::Thirty]
        );
        assert_eq!(
            sched.due(ts("2024-03-06T11:00:00Z")),
            vec![BucketKey::Thirty, BucketKey::Hour, BucketKey::Default]
        );
        assert_eq!(
            sched.due(ts("2024-03-06T12:00:30Z")),
            vec![
                BucketKey::Thirty,
                BucketKey::Hour,
                BucketKey::TwoHour,
                BucketKey::FourHour,
                BucketKey::Default
            ]
        );
    }

    #[test]
    fn trigger_resets_window() {
        let mut sched = BucketScheduler::new();
        sched.register(BucketKey::Thirty, "0 */30 * * * *", None, ts("2024-03-06T10:05:00Z"));

        let now = ts("2024-03-06T10:30:10Z");
        assert!(sched.should_run(BucketKey::Thirty, now));
        sched.record_trigger_at(BucketKey::Thirty, now);
        assert!(!sched.should_run(BucketKey::Thirty, ts("2024-03-06T10:45:00Z")));
        assert!(sched.should_run(BucketKey::Thirty, ts("2024-03-06T11:00:00Z")));
    }

    #[test]
    fn cooldown_blocks_every_minute_cron() {
        let mut sched = BucketScheduler::new();
        let (cron, cooldown) = cron_for_minutes(90);
        sched.register(BucketKey::Default, cron, cooldown, ts("2024-03-06T10:00:00Z"));

        assert!(!sched.should_run(BucketKey::Default, ts("2024-03-06T11:00:00Z")));
        assert!(sched.should_run(BucketKey::Default, ts("2024-03-06T11:30:00Z")));
    }

    #[test]
    fn invalid_cron_never_runs() {
        let mut sched = BucketScheduler::new();
        sched.register(BucketKey::Hour, "not a cron", None, ts("2024-03-06T10:00:00Z"));
        assert!(!sched.should_run(BucketKey::Hour, ts("2024-03-07T10:00:00Z")));
    }

    #[test]
    fn unknown_bucket_never_runs() {
        let sched = BucketScheduler::default();
        assert!(sched.is_empty());
        assert!(!sched.should_run(BucketKey::Hour, Utc::now()));
        assert!(sched.get(BucketKey::Hour).is_none());
    }
}
