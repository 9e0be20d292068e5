//! Send path shared by both escalation policies.
//!
//! Every owner-facing send passes the same gates: in testing mode the owner
//! must be allowlisted and inside the testing window, and an approved
//! exclusion suppresses the send. Stages that carry a waiting flag claim it
//! in the store before any jitter sleep, so two ticks can never both send.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{Mutex, RwLock};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use laggard_core::config::EngineSettings;
use laggard_core::{DeviceComplianceRecord, RecordUpdate};
use laggard_notify::templating::{ACK_NUDGE, REQUESTED_REMINDER};
use laggard_notify::{Message, MessageContext, MessageTemplates, Notifier, TemplateRenderer};
use laggard_storage::ComplianceStore;

use crate::error::EscalationError;

/// Upper bound of the random delay before a first message.
pub const FIRST_MESSAGE_JITTER: Duration = Duration::from_secs(60);
/// Upper bound of the random delay before a bucket reminder.
pub const REMINDER_JITTER: Duration = Duration::from_secs(120);

const ACK_CALLBACK: &str = "ack_it";
const REMINDER_TITLE: &str = "Update Reminder";
const FIRST_SENT_FORMAT: &str = "%A, %B %-d, %Y %-I:%M %p";

pub struct Messenger {
    store: Arc<dyn ComplianceStore>,
    notifier: Arc<dyn Notifier>,
    settings: Arc<RwLock<EngineSettings>>,
    templates: MessageTemplates,
    renderer: TemplateRenderer,
    first_jitter: Duration,
    reminder_jitter: Duration,
    tasks: TaskTracker,
    /// Last successful nudge or reminder per serial.
    last_nudged: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Messenger {
    pub fn new(
        store: Arc<dyn ComplianceStore>,
        notifier: Arc<dyn Notifier>,
        settings: Arc<RwLock<EngineSettings>>,
        templates: MessageTemplates,
    ) -> Self {
        Self {
            store,
            notifier,
            settings,
            templates,
            renderer: TemplateRenderer::new(),
            first_jitter: FIRST_MESSAGE_JITTER,
            reminder_jitter: REMINDER_JITTER,
            tasks: TaskTracker::new(),
            last_nudged: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_jitter(mut self, first: Duration, reminder: Duration) -> Self {
        self.first_jitter = first;
        self.reminder_jitter = reminder;
        self
    }

    pub fn store(&self) -> &Arc<dyn ComplianceStore> {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn templates(&self) -> &MessageTemplates {
        &self.templates
    }

    pub fn renderer(&self) -> &TemplateRenderer {
        &self.renderer
    }

    /// Snapshot of the current engine settings.
    pub async fn settings(&self) -> EngineSettings {
        self.settings.read().await.clone()
    }

    /// Number of spawned sends still running.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every spawned send to finish.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Clear waiting flags left behind by sends that never finished (a crash
    /// or a shutdown mid-jitter). Only sound while nothing is in flight.
    pub async fn release_stale_claims(&self) -> Result<usize, EscalationError> {
        let mut released = 0;
        for record in self.store.get_tracked().await? {
            let serial = &record.serial_number;
            if record.first_message_waiting && !record.first_message_sent {
                self.store
                    .update_flags(serial, &RecordUpdate::release_first_message())
                    .await?;
                released += 1;
            }
            if record.reminder_waiting {
                self.store
                    .update_flags(serial, &RecordUpdate::release_reminder())
                    .await?;
                released += 1;
            }
        }
        if released > 0 {
            info!(released, "released stale send claims");
        }
        Ok(released)
    }

    // ── Gating ────────────────────────────────────────────────────

    /// Whether the owner of `record` may be contacted at `now`.
    pub async fn may_contact(
        &self,
        record: &DeviceComplianceRecord,
        settings: &EngineSettings,
        now: DateTime<Utc>,
    ) -> bool {
        let serial = &record.serial_number;
        if settings.testing {
            if !settings.is_test_user(&record.user_id) {
                debug!(serial = %serial, user = %record.user_id, "testing mode: owner not allowlisted");
                return false;
            }
            match settings.testing_window() {
                Ok(window) if window.contains_local(now, record.tz_offset) => {}
                Ok(_) => {
                    debug!(serial = %serial, user = %record.user_id, "outside testing window");
                    return false;
                }
                Err(e) => {
                    warn!(error = %e, "invalid testing window, holding sends");
                    return false;
                }
            }
        }

        match self.store.is_excluded(serial).await {
            Ok(Some(exclusion)) if exclusion.is_active(now) => {
                info!(serial = %serial, reason = %exclusion.reason, "device excluded, skipping send");
                false
            }
            Ok(_) => true,
            Err(e) => {
                warn!(serial = %serial, error = %e, "exclusion lookup failed, skipping send");
                false
            }
        }
    }

    pub async fn nudged_within(
        &self,
        serial: &str,
        window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> bool {
        self.last_nudged
            .lock()
            .await
            .get(serial)
            .is_some_and(|at| now.signed_duration_since(*at) < window)
    }

    async fn mark_nudged(&self, serial: &str, at: DateTime<Utc>) {
        self.last_nudged.lock().await.insert(serial.to_string(), at);
    }

    /// Drop per-device bookkeeping for retired serials.
    pub async fn forget(&self, serials: &[String]) {
        let mut nudged = self.last_nudged.lock().await;
        for s in serials {
            nudged.remove(s);
        }
    }

    // ── Message building ──────────────────────────────────────────

    pub fn context(
        &self,
        record: &DeviceComplianceRecord,
        settings: &EngineSettings,
    ) -> MessageContext {
        MessageContext {
            service_name: settings.service_name.clone(),
            serial: record.serial_number.clone(),
            user_name: record.display_name().to_string(),
            user_id: record.user_id.clone(),
            manager_id: record.manager_id.clone(),
            model: record.model.clone(),
            os_version: record.os_version.clone(),
            required_version: settings.required_version.clone(),
            deadline: deadline_label(settings),
            cutoff: settings.cutoff_time.clone(),
            first_message: record
                .first_message_sent_at
                .map(|t| {
                    t.with_timezone(&record.locale())
                        .format(FIRST_SENT_FORMAT)
                        .to_string()
                })
                .unwrap_or_default(),
            items: Vec::new(),
        }
    }

    pub fn first_message(
        &self,
        record: &DeviceComplianceRecord,
        settings: &EngineSettings,
    ) -> Result<Message, EscalationError> {
        let text = self
            .renderer
            .render(&self.templates.first_message, &self.context(record, settings))?;
        Ok(Message::text(text)
            .with_title(format!("Device: {}", record.serial_number))
            .with_callback(ACK_CALLBACK)
            .with_ack_button()
            .with_footer(format!(
                "Model: {}, OS: {}",
                record.model, record.os_version
            )))
    }

    pub fn reminder_message(
        &self,
        record: &DeviceComplianceRecord,
        settings: &EngineSettings,
    ) -> Result<Message, EscalationError> {
        let text = self
            .renderer
            .render(&self.templates.reminder, &self.context(record, settings))?;
        Ok(with_reminder_fields(Message::text(text), record, settings))
    }

    pub fn nudge_message(record: &DeviceComplianceRecord, settings: &EngineSettings) -> Message {
        with_reminder_fields(Message::text(ACK_NUDGE), record, settings)
    }

    pub fn requested_message(
        record: &DeviceComplianceRecord,
        settings: &EngineSettings,
    ) -> Message {
        with_reminder_fields(Message::text(REQUESTED_REMINDER), record, settings)
    }

    pub fn manager_message(
        &self,
        record: &DeviceComplianceRecord,
        settings: &EngineSettings,
    ) -> Result<Message, EscalationError> {
        let text = self
            .renderer
            .render(&self.templates.manager, &self.context(record, settings))?;
        Ok(Message::text(text))
    }

    fn list_message(
        &self,
        template: &str,
        items: Vec<String>,
        settings: &EngineSettings,
    ) -> Result<Message, EscalationError> {
        let ctx = MessageContext {
            service_name: settings.service_name.clone(),
            required_version: settings.required_version.clone(),
            deadline: deadline_label(settings),
            cutoff: settings.cutoff_time.clone(),
            items,
            ..Default::default()
        };
        Ok(Message::text(self.renderer.render(template, &ctx)?))
    }

    // ── Stage 1: first message ────────────────────────────────────

    /// Claim the first-message flag, then deliver after a random delay.
    ///
    /// Returns `true` when a send was scheduled.
    pub async fn send_first(
        self: &Arc<Self>,
        record: &DeviceComplianceRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, EscalationError> {
        let settings = self.settings().await;
        if !self.may_contact(record, &settings, now).await {
            return Ok(false);
        }
        if !self.store.claim_first_message(&record.serial_number).await? {
            debug!(serial = %record.serial_number, "first message already claimed");
            return Ok(false);
        }

        let delay = jitter(self.first_jitter);
        let this = Arc::clone(self);
        let record = record.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            this.deliver_first(&record, &settings).await;
        });
        Ok(true)
    }

    async fn deliver_first(&self, record: &DeviceComplianceRecord, settings: &EngineSettings) {
        let serial = &record.serial_number;
        let update = match self.first_message(record, settings) {
            Ok(message) => match self.notifier.send_direct(&record.user_id, &message).await {
                Ok(delivery) => {
                    info!(serial = %serial, user = %record.user_id, "first message sent");
                    RecordUpdate::first_message_delivered(delivery.sent_at)
                }
                Err(e) => {
                    warn!(serial = %serial, user = %record.user_id, error = %e, "first message failed");
                    RecordUpdate::release_first_message()
                }
            },
            Err(e) => {
                warn!(serial = %serial, error = %e, "first message could not be rendered");
                RecordUpdate::release_first_message()
            }
        };
        if let Err(e) = self.store.update_flags(serial, &update).await {
            warn!(serial = %serial, error = %e, "could not record first message outcome");
        }
    }

    // ── Stage 2: acknowledge nudge ────────────────────────────────

    pub async fn resend_first(
        &self,
        record: &DeviceComplianceRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, EscalationError> {
        let settings = self.settings().await;
        if !self.may_contact(record, &settings, now).await {
            return Ok(false);
        }
        let message = Self::nudge_message(record, &settings);
        match self.notifier.send_direct(&record.user_id, &message).await {
            Ok(delivery) => {
                info!(serial = %record.serial_number, user = %record.user_id, "acknowledge nudge sent");
                self.mark_nudged(&record.serial_number, delivery.sent_at).await;
                Ok(true)
            }
            Err(e) => {
                warn!(serial = %record.serial_number, user = %record.user_id, error = %e, "acknowledge nudge failed");
                Ok(false)
            }
        }
    }

    // ── Stage 3: policy reminder ──────────────────────────────────

    /// Claim the reminder flag and deliver right away.
    pub async fn send_reminder(
        &self,
        record: &DeviceComplianceRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, EscalationError> {
        let settings = self.settings().await;
        if !self.may_contact(record, &settings, now).await {
            return Ok(false);
        }
        if !self.store.claim_reminder(&record.serial_number).await? {
            debug!(serial = %record.serial_number, "reminder already in flight");
            return Ok(false);
        }
        self.deliver_reminder(record, &settings).await;
        Ok(true)
    }

    /// Claim the reminder flag now and deliver after `delay`.
    pub async fn schedule_reminder(
        self: &Arc<Self>,
        record: &DeviceComplianceRecord,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, EscalationError> {
        let settings = self.settings().await;
        if !self.may_contact(record, &settings, now).await {
            return Ok(false);
        }
        if !self.store.claim_reminder(&record.serial_number).await? {
            debug!(serial = %record.serial_number, "reminder already in flight");
            return Ok(false);
        }

        debug!(serial = %record.serial_number, delay_secs = delay.as_secs(), "reminder scheduled");
        let this = Arc::clone(self);
        let record = record.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            this.deliver_reminder(&record, &settings).await;
        });
        Ok(true)
    }

    /// Bucket dispatch: a scheduled reminder with the reminder jitter.
    pub async fn dispatch_reminder(
        self: &Arc<Self>,
        record: &DeviceComplianceRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, EscalationError> {
        self.schedule_reminder(record, jitter(self.reminder_jitter), now)
            .await
    }

    async fn deliver_reminder(&self, record: &DeviceComplianceRecord, settings: &EngineSettings) {
        let serial = &record.serial_number;
        match self.reminder_message(record, settings) {
            Ok(message) => match self.notifier.send_direct(&record.user_id, &message).await {
                Ok(delivery) => {
                    info!(serial = %serial, user = %record.user_id, "reminder sent");
                    self.mark_nudged(serial, delivery.sent_at).await;
                }
                Err(e) => {
                    warn!(serial = %serial, user = %record.user_id, error = %e, "reminder failed");
                }
            },
            Err(e) => warn!(serial = %serial, error = %e, "reminder could not be rendered"),
        }
        if let Err(e) = self
            .store
            .update_flags(serial, &RecordUpdate::release_reminder())
            .await
        {
            warn!(serial = %serial, error = %e, "could not release reminder flag");
        }
    }

    // ── Stage 4: manager ──────────────────────────────────────────

    /// Open a conversation with the manager and the owner and post the
    /// manager message.
    pub async fn send_manager(
        &self,
        record: &DeviceComplianceRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, EscalationError> {
        let serial = &record.serial_number;
        if !record.has_manager() {
            warn!(serial = %serial, user = %record.user_id, "no manager on record, skipping manager message");
            return Ok(false);
        }
        if !record.first_message_sent {
            return Ok(false);
        }
        let settings = self.settings().await;
        if !self.may_contact(record, &settings, now).await {
            return Ok(false);
        }

        let message = self.manager_message(record, &settings)?;
        let members = [record.manager_id.clone(), record.user_id.clone()];
        match self.notifier.send_between(&members, &message).await {
            Ok(delivery) => {
                self.store
                    .update_flags(serial, &RecordUpdate::manager_notified(delivery.sent_at))
                    .await?;
                info!(serial = %serial, user = %record.user_id, manager = %record.manager_id, "manager message sent");
                Ok(true)
            }
            Err(e) => {
                warn!(serial = %serial, manager = %record.manager_id, error = %e, "manager message failed");
                Ok(false)
            }
        }
    }

    // ── Requested (ad-hoc) reminders ──────────────────────────────

    /// Claim the delay flag and deliver the requested reminder after `delay`.
    /// A failed send releases the flag.
    pub async fn schedule_requested(
        self: &Arc<Self>,
        record: &DeviceComplianceRecord,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, EscalationError> {
        let settings = self.settings().await;
        if !self.may_contact(record, &settings, now).await {
            return Ok(false);
        }
        if !self.store.claim_delay(&record.serial_number).await? {
            return Ok(false);
        }

        let this = Arc::clone(self);
        let record = record.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            let serial = &record.serial_number;
            let message = Self::requested_message(&record, &settings);
            match this.notifier.send_direct(&record.user_id, &message).await {
                Ok(_) => info!(serial = %serial, user = %record.user_id, "requested reminder sent"),
                Err(e) => {
                    warn!(serial = %serial, user = %record.user_id, error = %e, "requested reminder failed");
                    if let Err(e) = this
                        .store
                        .update_flags(serial, &RecordUpdate::delay_sent(false))
                        .await
                    {
                        warn!(serial = %serial, error = %e, "could not release delay flag");
                    }
                }
            }
        });
        Ok(true)
    }

    // ── Operator alerts ───────────────────────────────────────────

    async fn alert(&self, message: &Message, settings: &EngineSettings) -> Result<bool, EscalationError> {
        let Some(channel) = settings.alert_channel.as_deref() else {
            warn!("no alert channel configured, dropping alert");
            return Ok(false);
        };
        self.notifier.post_channel(channel, message).await?;
        Ok(true)
    }

    pub async fn alert_missing_managers(&self, owners: Vec<String>) -> Result<bool, EscalationError> {
        let settings = self.settings().await;
        let message = self.list_message(&self.templates.missing_managers, owners, &settings)?;
        self.alert(&message, &settings).await
    }

    /// Post the still-tracked devices to the alert channel.
    pub async fn alert_deadline_passed(&self) -> Result<bool, EscalationError> {
        let settings = self.settings().await;
        let items = self
            .store
            .get_tracked()
            .await?
            .iter()
            .map(|r| format!("{} ({}, {})", r.serial_number, r.display_name(), r.os_version))
            .collect();
        let message = self.list_message(&self.templates.deadline_passed, items, &settings)?;
        self.alert(&message, &settings).await
    }
}

fn deadline_label(settings: &EngineSettings) -> String {
    format!("{} {}", settings.deadline, settings.cutoff_time)
}

fn with_reminder_fields(
    message: Message,
    record: &DeviceComplianceRecord,
    settings: &EngineSettings,
) -> Message {
    message
        .with_title(REMINDER_TITLE)
        .with_field("Required Version", settings.required_version.as_str())
        .with_field("Update Deadline", deadline_label(settings))
        .with_field("Current Version", record.os_version.as_str())
        .with_field("Serial Number", record.serial_number.as_str())
}

/// A uniformly random delay in `[0, max]`.
fn jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
