//! Interval buckets: in-memory grouping of tracked devices by reminder cadence.
//!
//! A serial is a member of at most one bucket at any time. All mutation
//! happens under the write lock in one pass, so a reader never observes a
//! device in two buckets or in none mid-move.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::Serialize;
use tokio::sync::RwLock;

use laggard_core::DeviceComplianceRecord;

/// Reminder cadence of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketKey {
    Thirty,
    Hour,
    TwoHour,
    FourHour,
    Default,
}

impl BucketKey {
    pub const ALL: [BucketKey; 5] = [
        BucketKey::Thirty,
        BucketKey::Hour,
        BucketKey::TwoHour,
        BucketKey::FourHour,
        BucketKey::Default,
    ];

    /// The bucket for a stored `reminder_interval` (minutes). Anything but
    /// the four fixed cadences falls into `Default`.
    pub fn for_interval(minutes: i32) -> Self {
        match minutes {
            30 => BucketKey::Thirty,
            60 => BucketKey::Hour,
            120 => BucketKey::TwoHour,
            240 => BucketKey::FourHour,
            _ => BucketKey::Default,
        }
    }

    pub fn minutes(self, default_minutes: u32) -> u32 {
        match self {
            BucketKey::Thirty => 30,
            BucketKey::Hour => 60,
            BucketKey::TwoHour => 120,
            BucketKey::FourHour => 240,
            BucketKey::Default => default_minutes,
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BucketKey::Thirty => "thirty",
            BucketKey::Hour => "hour",
            BucketKey::TwoHour => "two_hour",
            BucketKey::FourHour => "four_hour",
            BucketKey::Default => "default",
        };
        f.write_str(s)
    }
}

/// Membership changes made by one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketChanges {
    pub moved: usize,
    pub dropped: usize,
}

impl BucketChanges {
    pub fn is_empty(&self) -> bool {
        self.moved == 0 && self.dropped == 0
    }
}

#[derive(Debug, Default)]
pub struct BucketSet {
    buckets: RwLock<BTreeMap<BucketKey, Vec<DeviceComplianceRecord>>>,
}

impl BucketSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place every record in the bucket for its interval and drop serials
    /// that are no longer tracked. Members already in the right bucket keep
    /// their position; their snapshot is refreshed.
    pub async fn reconcile(&self, records: &[DeviceComplianceRecord]) -> BucketChanges {
        let mut buckets = self.buckets.write().await;
        let mut changes = BucketChanges::default();

        for record in records {
            let serial = record.serial_number.as_str();
            let want = BucketKey::for_interval(record.reminder_interval);

            let members = buckets.entry(want).or_default();
            if let Some(existing) = members.iter_mut().find(|m| m.serial_number == serial) {
                *existing = record.clone();
                continue;
            }
            members.push(record.clone());

            for (key, members) in buckets.iter_mut() {
                if *key != want {
                    members.retain(|m| m.serial_number != serial);
                }
            }
            changes.moved += 1;
        }

        let tracked: HashSet<&str> = records.iter().map(|r| r.serial_number.as_str()).collect();
        for members in buckets.values_mut() {
            let before = members.len();
            members.retain(|m| tracked.contains(m.serial_number.as_str()));
            changes.dropped += before - members.len();
        }

        changes
    }

    /// Remove serials from every bucket. Returns how many memberships went.
    pub async fn remove(&self, serials: &[String]) -> usize {
        let gone: HashSet<&str> = serials.iter().map(String::as_str).collect();
        let mut buckets = self.buckets.write().await;
        let mut removed = 0;
        for members in buckets.values_mut() {
            let before = members.len();
            members.retain(|m| !gone.contains(m.serial_number.as_str()));
            removed += before - members.len();
        }
        removed
    }

    /// Copy of one bucket's members, taken under the read lock.
    pub async fn snapshot(&self, key: BucketKey) -> Vec<DeviceComplianceRecord> {
        self.buckets
            .read()
            .await
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    /// The bucket currently holding `serial`.
    pub async fn bucket_of(&self, serial: &str) -> Option<BucketKey> {
        self.buckets
            .read()
            .await
            .iter()
            .find(|(_, members)| members.iter().any(|m| m.serial_number == serial))
            .map(|(key, _)| *key)
    }

    /// Serials per bucket.
    pub async fn membership(&self) -> BTreeMap<BucketKey, Vec<String>> {
        self.buckets
            .read()
            .await
            .iter()
            .map(|(key, members)| {
                (
                    *key,
                    members.iter().map(|m| m.serial_number.clone()).collect(),
                )
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.buckets.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use proptest::prelude::*;

    use super::*;

    fn rec(serial: &str, interval: i32) -> DeviceComplianceRecord {
        let mut r = DeviceComplianceRecord::new_tracked(serial, Utc::now());
        r.reminder_interval = interval;
        r
    }

    #[test]
    fn interval_maps_to_bucket() {
        assert_eq!(BucketKey::for_interval(30), BucketKey::Thirty);
        assert_eq!(BucketKey::for_interval(60), BucketKey::Hour);
        assert_eq!(BucketKey::for_interval(120), BucketKey::TwoHour);
        assert_eq!(BucketKey::for_interval(240), BucketKey::FourHour);
        assert_eq!(BucketKey::for_interval(0), BucketKey::Default);
        assert_eq!(BucketKey::for_interval(45), BucketKey::Default);
        assert_eq!(BucketKey::Default.minutes(90), 90);
    }

    #[tokio::test]
    async fn moved_record_leaves_old_bucket() {
        let set = BucketSet::new();
        set.reconcile(&[rec("SN001", 30)]).await;
        assert_eq!(set.bucket_of("SN001").await, Some(BucketKey::Thirty));

        let changes = set.reconcile(&[rec("SN001", 60)]).await;
        assert_eq!(changes.moved, 1);
        assert_eq!(set.bucket_of("SN001").await, Some(BucketKey::Hour));
        assert!(set.snapshot(BucketKey::Thirty).await.is_empty());
        assert_eq!(set.len().await, 1);
    }

    #[tokio::test]
    async fn untracked_records_are_dropped() {
        let set = BucketSet::new();
        set.reconcile(&[rec("A", 30), rec("B", 0)]).await;
        let changes = set.reconcile(&[rec("A", 30)]).await;
        assert_eq!(changes, BucketChanges { moved: 0, dropped: 1 });
        assert_eq!(set.bucket_of("B").await, None);
    }

    #[tokio::test]
    async fn second_pass_is_a_no_op() {
        let set = BucketSet::new();
        let records = vec![rec("A", 30), rec("B", 60), rec("C", 0)];
        set.reconcile(&records).await;
        let before = set.membership().await;
        assert!(set.reconcile(&records).await.is_empty());
        assert_eq!(set.membership().await, before);
    }

    #[tokio::test]
    async fn remove_clears_every_bucket() {
        let set = BucketSet::new();
        set.reconcile(&[rec("A", 30), rec("B", 240)]).await;
        assert_eq!(set.remove(&["A".into(), "Z".into()]).await, 1);
        assert_eq!(set.bucket_of("A").await, None);
        assert_eq!(set.bucket_of("B").await, Some(BucketKey::FourHour));
    }

    #[tokio::test]
    async fn snapshot_refreshes_in_place() {
        let set = BucketSet::new();
        set.reconcile(&[rec("A", 30), rec("B", 30)]).await;
        let mut a = rec("A", 30);
        a.reminder_waiting = true;
        set.reconcile(&[a, rec("B", 30)]).await;
        let members = set.snapshot(BucketKey::Thirty).await;
        assert_eq!(members[0].serial_number, "A");
        assert!(members[0].reminder_waiting);
    }

    fn interval_strategy() -> impl Strategy<Value = i32> {
        prop_oneof![Just(0), Just(30), Just(60), Just(120), Just(240), 1..500i32]
    }

    fn pass_strategy() -> impl Strategy<Value = Vec<(u8, i32)>> {
        prop::collection::vec((0u8..12, interval_strategy()), 0..20)
    }

    fn to_records(pass: &[(u8, i32)]) -> Vec<DeviceComplianceRecord> {
        let mut seen = HashSet::new();
        pass.iter()
            .filter(|(id, _)| seen.insert(*id))
            .map(|(id, interval)| rec(&format!("SN{id:03}"), *interval))
            .collect()
    }

    proptest! {
        #[test]
        fn every_serial_in_exactly_one_bucket(passes in prop::collection::vec(pass_strategy(), 1..8)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let set = BucketSet::new();
                for pass in &passes {
                    let records = to_records(pass);
                    set.reconcile(&records).await;

                    let membership = set.membership().await;
                    let mut seen = HashSet::new();
                    for serials in membership.values() {
                        for s in serials {
                            prop_assert!(seen.insert(s.clone()), "{} in two buckets", s);
                        }
                    }
                    prop_assert_eq!(seen.len(), records.len());
                    for r in &records {
                        let want = BucketKey::for_interval(r.reminder_interval);
                        prop_assert!(membership[&want].contains(&r.serial_number));
                    }
                }
                Ok(())
            })?;
        }

        #[test]
        fn reconcile_is_idempotent(pass in pass_strategy()) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let set = BucketSet::new();
                let records = to_records(&pass);
                set.reconcile(&records).await;
                let first = set.membership().await;
                let changes = set.reconcile(&records).await;
                prop_assert!(changes.is_empty());
                prop_assert_eq!(set.membership().await, first);
                Ok(())
            })?;
        }
    }
}
