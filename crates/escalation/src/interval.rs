//! Continuous reminders: after acknowledgement, each device is reminded at
//! its own interval (30/60/120/240 minutes or the default) until it is
//! compliant.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use laggard_core::config::EngineSettings;
use laggard_core::DeviceComplianceRecord;
use laggard_notify::Message;

use crate::bucket::{BucketKey, BucketSet};
use crate::error::EscalationError;
use crate::messenger::Messenger;
use crate::policy::{EscalationPolicy, TickReport};
use crate::scheduler::BucketScheduler;

/// How close (minutes) to an interval boundary a check pass schedules a
/// delayed send instead of waiting for the next pass.
pub const SCHEDULE_WINDOW_MINUTES: i64 = 15;

pub struct IntervalBucketPolicy {
    messenger: Arc<Messenger>,
    buckets: BucketSet,
    scheduler: Mutex<BucketScheduler>,
    registered: OnceCell<()>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum IntervalStep {
    Skip,
    SendFirst,
    Nudge,
    /// Send after the given delay.
    Schedule(Duration),
    SendNow,
}

impl IntervalBucketPolicy {
    pub fn new(messenger: Arc<Messenger>) -> Self {
        Self {
            messenger,
            buckets: BucketSet::new(),
            scheduler: Mutex::new(BucketScheduler::new()),
            registered: OnceCell::new(),
        }
    }

    pub fn buckets(&self) -> &BucketSet {
        &self.buckets
    }

    pub(crate) fn step(
        record: &DeviceComplianceRecord,
        settings: &EngineSettings,
        now: DateTime<Utc>,
    ) -> IntervalStep {
        if !record.first_message_sent {
            if record.first_message_waiting {
                return IntervalStep::Skip;
            }
            return IntervalStep::SendFirst;
        }

        let default = settings.default_reminder();
        if !record.first_ack {
            return match record.first_message_sent_at {
                Some(sent) if now.signed_duration_since(sent) < default => IntervalStep::Skip,
                _ => IntervalStep::Nudge,
            };
        }

        let Some(acked) = record.first_ack_time else {
            return IntervalStep::Skip;
        };
        let ack_age = now.signed_duration_since(acked);
        let test_user = settings.testing && settings.is_test_user(&record.user_id);
        if ack_age <= default && !test_user {
            return IntervalStep::Skip;
        }

        if record.reminder_waiting {
            return IntervalStep::Skip;
        }
        let interval = Self::interval_of(record, settings);

        let diff = ack_age - interval;
        let distance = if diff < chrono::Duration::zero() { -diff } else { diff };
        if distance < chrono::Duration::minutes(SCHEDULE_WINDOW_MINUTES) {
            IntervalStep::Schedule(distance.to_std().unwrap_or_default())
        } else if ack_age >= interval {
            IntervalStep::SendNow
        } else {
            IntervalStep::Skip
        }
    }

    fn interval_of(record: &DeviceComplianceRecord, settings: &EngineSettings) -> chrono::Duration {
        if record.reminder_interval > 0 {
            chrono::Duration::minutes(i64::from(record.reminder_interval))
        } else {
            settings.default_reminder()
        }
    }

    async fn act(
        &self,
        record: &DeviceComplianceRecord,
        settings: &EngineSettings,
        now: DateTime<Utc>,
    ) -> Result<bool, EscalationError> {
        let serial = &record.serial_number;
        match Self::step(record, settings, now) {
            IntervalStep::Skip => Ok(false),
            IntervalStep::SendFirst => self.messenger.send_first(record, now).await,
            IntervalStep::Nudge => {
                if self
                    .messenger
                    .nudged_within(serial, settings.default_reminder(), now)
                    .await
                {
                    return Ok(false);
                }
                self.messenger.resend_first(record, now).await
            }
            IntervalStep::Schedule(delay) => {
                self.messenger.schedule_reminder(record, delay, now).await
            }
            IntervalStep::SendNow => {
                let interval = Self::interval_of(record, settings);
                if self.messenger.nudged_within(serial, interval, now).await {
                    return Ok(false);
                }
                self.messenger.send_reminder(record, now).await
            }
        }
    }

    /// Fire one due bucket: every acknowledged member not already waiting
    /// gets a jittered reminder.
    async fn fire(&self, key: BucketKey, now: DateTime<Utc>, report: &mut TickReport) {
        let members = self.buckets.snapshot(key).await;
        debug!(bucket = %key, members = members.len(), "bucket due");

        for member in &members {
            let serial = &member.serial_number;
            let current = match self.messenger.store().get_by_serial(serial).await {
                Ok(Some(r)) => r,
                Ok(None) => continue,
                Err(e) => {
                    warn!(serial = %serial, user = %member.user_id, error = %e, "could not read reminder state, skipping");
                    report.failed += 1;
                    continue;
                }
            };
            if current.reminder_waiting || !current.first_ack {
                continue;
            }
            match self.messenger.dispatch_reminder(&current, now).await {
                Ok(true) => report.dispatched += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(serial = %serial, user = %current.user_id, error = %e, "bucket reminder failed");
                    report.failed += 1;
                }
            }
        }
    }
}

#[async_trait]
impl EscalationPolicy for IntervalBucketPolicy {
    fn name(&self) -> &'static str {
        "interval"
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

        debug!(policy = "interval", report = %report.summary(), "check complete");
        Ok(report)
    }

    async fn poll(&self, now: DateTime<Utc>) -> Result<TickReport, EscalationError> {
        let settings = self.messenger.settings().await;
        self.registered
            .get_or_init(|| async {
                self.scheduler
                    .lock()
                    .await
                    .register_buckets(settings.default_reminder_interval, now);
                info!(
                    default_minutes = settings.default_reminder_interval,
                    "reminder buckets registered"
                );
            })
            .await;

        let records = self.messenger.store().get_tracked().await?;
        let changes = self.buckets.reconcile(&records).await;
        if !changes.is_empty() {
            debug!(moved = changes.moved, dropped = changes.dropped, "buckets reconciled");
        }

        let mut report = TickReport {
            examined: records.len(),
            ..Default::default()
        };
        let due = self.scheduler.lock().await.due(now);
        for key in due {
            self.fire(key, now, &mut report).await;
            self.scheduler.lock().await.record_trigger_at(key, now);
        }
        Ok(report)
    }

    async fn device_diff(&self, retired: &[String]) {
        let removed = self.buckets.remove(retired).await;
        self.messenger.forget(retired).await;
        if removed > 0 {
            debug!(removed, "retired devices left their buckets");
        }
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

    async fn on_deadline(&self, _now: DateTime<Utc>) -> Result<(), EscalationError> {
        self.messenger.alert_deadline_passed().await?;
        Ok(())
    }
}
