//! Fixed weekly escalation: first message, acknowledge nudges, then the
//! manager on a set weekday once the acknowledgement is old enough.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use tracing::{debug, info, warn};

use laggard_connector::IdentityProvider;
use laggard_core::config::EngineSettings;
use laggard_core::{clock, DeviceComplianceRecord, Person, RecordUpdate};
use laggard_notify::Message;

use crate::error::EscalationError;
use crate::messenger::Messenger;
use crate::policy::{EscalationPolicy, TickReport};

pub struct CadencePolicy {
    messenger: Arc<Messenger>,
    identity: Arc<dyn IdentityProvider>,
}

/// The action a check pass takes for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CadenceStep {
    Skip,
    SendFirst,
    Nudge,
    Escalate,
}

impl CadencePolicy {
    pub fn new(messenger: Arc<Messenger>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            messenger,
            identity,
        }
    }

    /// Decide what `record` needs at `now`, ignoring the nudge history.
    pub(crate) fn step(
        record: &DeviceComplianceRecord,
        settings: &EngineSettings,
        now: DateTime<Utc>,
    ) -> CadenceStep {
        if !record.first_message_sent {
            if record.first_message_waiting {
                return CadenceStep::Skip;
            }
            return CadenceStep::SendFirst;
        }

        if !record.first_ack {
            let resend_after = chrono::Duration::hours(i64::from(settings.resend_after_hours));
            return match record.first_message_sent_at {
                Some(sent) if now.signed_duration_since(sent) < resend_after => CadenceStep::Skip,
                _ => CadenceStep::Nudge,
            };
        }

        let Some(acked) = record.first_ack_time else {
            return CadenceStep::Skip;
        };
        if record.manager_message_sent {
            return CadenceStep::Skip;
        }

        let threshold = chrono::Duration::hours(i64::from(settings.escalation_threshold_hours));
        if now.signed_duration_since(acked) < threshold {
            return CadenceStep::Skip;
        }

        let local_day = clock::local_time(now, record.tz_offset).weekday();
        let test_bypass = settings.testing && settings.is_test_user(&record.user_id);
        if local_day == settings.escalation_weekday || test_bypass {
            CadenceStep::Escalate
        } else {
            CadenceStep::Skip
        }
    }

    async fn act(
        &self,
        record: &DeviceComplianceRecord,
        settings: &EngineSettings,
        now: DateTime<Utc>,
    ) -> Result<bool, EscalationError> {
        match Self::step(record, settings, now) {
            CadenceStep::Skip => Ok(false),
            CadenceStep::SendFirst => self.messenger.send_first(record, now).await,
            CadenceStep::Nudge => {
                let window = chrono::Duration::hours(i64::from(settings.resend_after_hours));
                if self
                    .messenger
                    .nudged_within(&record.serial_number, window, now)
                    .await
                {
                    return Ok(false);
                }
                self.messenger.resend_first(record, now).await
            }
            CadenceStep::Escalate => self.messenger.send_manager(record, now).await,
        }
    }

    /// Manager chat id for a manager email, falling back to the email.
    async fn manager_chat_id(&self, manager_email: &str) -> String {
        match self
            .messenger
            .notifier()
            .lookup_user_by_email(manager_email)
            .await
        {
            Ok(Some(user)) => user.id,
            Ok(None) => manager_email.to_string(),
            Err(e) => {
                warn!(manager = %manager_email, error = %e, "manager lookup failed, storing email");
                manager_email.to_string()
            }
        }
    }
}

#[async_trait]
impl EscalationPolicy for CadencePolicy {
    fn name(&self) -> &'static str {
        "cadence"
    }

    async fn check(&self, now: DateTime<Utc>) -> Result<TickReport, EscalationError> {
        let settings = self.messenger.settings().await;
        let records = self.messenger.store().get_tracked().await?;
        let mut report = TickReport {
            examined: records.len(),
            ..Default::default()
        };

        for record in &records {
            match self.act(record, &settings, now).await {
                Ok(true) => report.dispatched += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(serial = %record.serial_number, user = %record.user_id, error = %e, "check failed for device");
                    report.failed += 1;
                }
            }
        }

        debug!(policy = "cadence", report = %report.summary(), "check complete");
        Ok(report)
    }

    async fn device_diff(&self, retired: &[String]) {
        self.messenger.forget(retired).await;
    }

    async fn first_message(
        &self,
        record: &DeviceComplianceRecord,
    ) -> Result<Message, EscalationError> {
        let settings = self.messenger.settings().await;
        self.messenger.first_message(record, &settings)
    }

    async fn reminder_message(
        &self,
        record: &DeviceComplianceRecord,
    ) -> Result<Message, EscalationError> {
        let settings = self.messenger.settings().await;
        self.messenger.reminder_message(record, &settings)
    }

    async fn table_associations(&self, serials: &[String]) -> Result<(), EscalationError> {
        if serials.is_empty() {
            return Ok(());
        }
        let wanted: HashSet<&str> = serials.iter().map(String::as_str).collect();
        let gaps: Vec<DeviceComplianceRecord> = self
            .messenger
            .store()
            .get_association_gaps()
            .await?
            .into_iter()
            .filter(|r| wanted.contains(r.serial_number.as_str()))
            .collect();
        if gaps.is_empty() {
            return Ok(());
        }

        let people: HashMap<String, Person> = self
            .identity
            .list_all_people()
            .await?
            .into_iter()
            .map(|p| (p.email.to_lowercase(), p))
            .collect();

        let mut missing = Vec::new();
        for record in &gaps {
            let manager_email = people
                .get(&record.user_email.to_lowercase())
                .map(|p| p.manager_email.trim())
                .filter(|m| !m.is_empty());
            let Some(manager_email) = manager_email else {
                missing.push(format!("{} ({})", record.display_name(), record.user_email));
                continue;
            };

            let manager_id = self.manager_chat_id(manager_email).await;
            match self
                .messenger
                .store()
                .update_flags(&record.serial_number, &RecordUpdate::manager(manager_id.as_str()))
                .await
            {
                Ok(()) => info!(serial = %record.serial_number, manager = %manager_id, "manager associated"),
                Err(e) => warn!(serial = %record.serial_number, error = %e, "could not store manager"),
            }
        }

        if !missing.is_empty() {
            warn!(count = missing.len(), "owners without a manager");
            if self.messenger.settings().await.send_manager_missing {
                self.messenger.alert_missing_managers(missing).await?;
            }
        }
        Ok(())
    }

    async fn on_deadline(&self, _now: DateTime<Utc>) -> Result<(), EscalationError> {
        self.messenger.alert_deadline_passed().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, TimeZone, Weekday};
    use laggard_storage::ComplianceStore;

    use super::*;
    use crate::testing::{record, settings, Harness, SentKind, StaticDirectory};

    /// 2024-03-06 was a Wednesday.
    fn wednesday(h: u32) -> DateTime<Utc> {
        Utc.from_utc_datetime(
            &NaiveDate::from_ymd_opt(2024, 3, 6)
                .unwrap()
                .and_hms_opt(h, 0, 0)
                .unwrap(),
        )
    }

    fn acked(serial: &str, ack_age: Duration, now: DateTime<Utc>) -> DeviceComplianceRecord {
        let mut r = record(serial);
        r.manager_id = "U-MGR".into();
        r.first_message_sent = true;
        r.first_message_sent_at = Some(now - ack_age - Duration::hours(1));
        r.first_ack = true;
        r.first_ack_time = Some(now - ack_age);
        r
    }

    fn policy(h: &Harness, people: Vec<Person>) -> CadencePolicy {
        CadencePolicy::new(h.messenger.clone(), Arc::new(StaticDirectory { people }))
    }

    #[test]
    fn waiting_flag_skips_first_send() {
        let mut r = record("SN001");
        assert_eq!(CadencePolicy::step(&r, &settings(), wednesday(12)), CadenceStep::SendFirst);
        r.first_message_waiting = true;
        assert_eq!(CadencePolicy::step(&r, &settings(), wednesday(12)), CadenceStep::Skip);
    }

    #[test]
    fn nudge_only_after_resend_window() {
        let now = wednesday(12);
        let mut r = record("SN001");
        r.first_message_sent = true;
        r.first_message_sent_at = Some(now - Duration::hours(23));
        assert_eq!(CadencePolicy::step(&r, &settings(), now), CadenceStep::Skip);
        r.first_message_sent_at = Some(now - Duration::hours(30));
        assert_eq!(CadencePolicy::step(&r, &settings(), now), CadenceStep::Nudge);
    }

    #[test]
    fn escalation_waits_for_threshold() {
        let now = wednesday(12);
        let r = acked("SN001", Duration::hours(47), now);
        assert_eq!(CadencePolicy::step(&r, &settings(), now), CadenceStep::Skip);
        let r = acked("SN001", Duration::hours(48), now);
        assert_eq!(CadencePolicy::step(&r, &settings(), now), CadenceStep::Escalate);
    }

    #[test]
    fn escalation_only_on_owner_local_weekday() {
        // 02:00 UTC Wednesday is still Tuesday at UTC-5.
        let now = wednesday(2);
        let mut r = acked("SN001", Duration::hours(72), now);
        assert_eq!(CadencePolicy::step(&r, &settings(), now), CadenceStep::Escalate);
        r.tz_offset = -5 * 3600;
        assert_eq!(CadencePolicy::step(&r, &settings(), now), CadenceStep::Skip);

        let thursday = wednesday(12) + Duration::days(1);
        let r = acked("SN001", Duration::hours(72), thursday);
        assert_eq!(CadencePolicy::step(&r, &settings(), thursday), CadenceStep::Skip);

        let mut s = settings();
        s.escalation_weekday = Weekday::Thu;
        assert_eq!(CadencePolicy::step(&r, &s, thursday), CadenceStep::Escalate);
    }

    #[test]
    fn test_users_bypass_weekday() {
        let thursday = wednesday(12) + Duration::days(1);
        let r = acked("SN001", Duration::hours(72), thursday);
        let mut s = settings();
        s.testing = true;
        s.testing_users = vec!["U-SN001".into()];
        assert_eq!(CadencePolicy::step(&r, &s, thursday), CadenceStep::Escalate);
    }

    #[test]
    fn manager_notified_is_skipped() {
        let now = wednesday(12);
        let mut r = acked("SN001", Duration::hours(72), now);
        r.manager_message_sent = true;
        assert_eq!(CadencePolicy::step(&r, &settings(), now), CadenceStep::Skip);
    }

    #[tokio::test]
    async fn check_sends_first_message_then_marks_sent() {
        let h = Harness::cadence(settings(), [record("SN001")]);
        let p = policy(&h, vec![]);

        let report = p.check(Utc::now()).await.unwrap();
        assert_eq!(report.dispatched, 1);
        h.messenger.drain().await;

        let r = h.store.get_by_serial("SN001").await.unwrap().unwrap();
        assert!(r.first_message_sent);
        assert_eq!(h.notifier.sent().len(), 1);

        // Nothing more to do until the resend window passes.
        let report = p.check(Utc::now()).await.unwrap();
        assert_eq!(report.dispatched, 0);
    }

    #[tokio::test]
    async fn stale_unacknowledged_message_is_resent_once_per_window() {
        let now = Utc::now();
        let mut r = record("SN001");
        r.first_message_sent = true;
        r.first_message_sent_at = Some(now - Duration::hours(30));
        let h = Harness::cadence(settings(), [r]);
        let p = policy(&h, vec![]);

        assert_eq!(p.check(now).await.unwrap().dispatched, 1);
        assert_eq!(p.check(now + Duration::minutes(15)).await.unwrap().dispatched, 0);
        assert_eq!(p.check(now + Duration::hours(25)).await.unwrap().dispatched, 1);

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|s| s.kind == SentKind::Direct));
    }

    #[tokio::test]
    async fn manager_escalation_happens_after_first_send_only() {
        let now = wednesday(12);
        let a = acked("SN001", Duration::hours(72), now);
        let mut b = acked("SN002", Duration::hours(72), now);
        b.manager_message_sent = true;
        let h = Harness::cadence(settings(), [a, b, record("SN003")]);
        let p = policy(&h, vec![]);

        let report = p.check(now).await.unwrap();
        h.messenger.drain().await;
        assert_eq!(report.examined, 3);
        assert_eq!(report.dispatched, 2);

        let between: Vec<_> = h
            .notifier
            .sent()
            .into_iter()
            .filter(|s| s.kind == SentKind::Between)
            .collect();
        assert_eq!(between.len(), 1);
        assert_eq!(between[0].target, "U-MGR,U-SN001");

        for r in h.store.get_tracked().await.unwrap() {
            if r.manager_message_sent {
                assert!(r.first_message_sent);
            }
        }
    }

    #[tokio::test]
    async fn associations_resolve_manager_chat_id() {
        let h = Harness::cadence(settings(), [record("SN001"), record("SN002")]);
        h.notifier.add_user("gandalf@example.com", "U-GANDALF", 0);
        let people = vec![
            Person {
                email: "SN001@example.com".into(),
                manager_email: "gandalf@example.com".into(),
                first_name: "Frodo".into(),
                last_name: "Baggins".into(),
            },
            Person {
                email: "sn002@example.com".into(),
                manager_email: "elrond@example.com".into(),
                ..Default::default()
            },
        ];
        let p = policy(&h, people);

        p.table_associations(&["SN001".into(), "SN002".into()])
            .await
            .unwrap();

        let a = h.store.get_by_serial("SN001").await.unwrap().unwrap();
        assert_eq!(a.manager_id, "U-GANDALF");
        let b = h.store.get_by_serial("SN002").await.unwrap().unwrap();
        assert_eq!(b.manager_id, "elrond@example.com");
    }

    #[tokio::test]
    async fn missing_managers_are_reported_when_enabled() {
        let mut s = settings();
        s.send_manager_missing = true;
        let h = Harness::cadence(s, [record("SN001")]);
        let p = policy(&h, vec![]);

        p.table_associations(&["SN001".into()]).await.unwrap();

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, SentKind::Channel);
        assert!(sent[0].message.text.contains("sn001@example.com"));
        assert!(h.store.get_by_serial("SN001").await.unwrap().unwrap().manager_id.is_empty());
    }

    #[tokio::test]
    async fn associations_ignore_other_serials() {
        let h = Harness::cadence(settings(), [record("SN001")]);
        let p = policy(
            &h,
            vec![Person {
                email: "sn001@example.com".into(),
                manager_email: "gandalf@example.com".into(),
                ..Default::default()
            }],
        );
        p.table_associations(&["SN999".into()]).await.unwrap();
        assert!(!h.store.get_by_serial("SN001").await.unwrap().unwrap().has_manager());
    }
}
