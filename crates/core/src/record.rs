//! Per-device compliance record and the escalation state derived from it.

use std::fmt;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::clock;

/// Tracked escalation progress for one out-of-compliance device.
///
/// Timestamps are `None` until the corresponding event has happened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceComplianceRecord {
    pub serial_number: String,
    /// Chat identity of the device owner.
    pub user_id: String,
    /// Chat identity of the owner's manager (empty when unresolved).
    pub manager_id: String,
    pub user_email: String,
    pub full_name: String,
    /// Fixed UTC offset of the owner's locale, in seconds.
    pub tz_offset: i32,

    pub os_version: String,
    pub model: String,
    pub platform: String,

    pub first_message_waiting: bool,
    pub first_message_sent: bool,
    pub first_message_sent_at: Option<DateTime<Utc>>,

    pub first_ack: bool,
    pub first_ack_time: Option<DateTime<Utc>>,

    pub manager_message_sent: bool,
    pub manager_message_sent_at: Option<DateTime<Utc>>,

    pub delay_at: Option<DateTime<Utc>>,
    pub delay_date: Option<String>,
    pub delay_time: Option<String>,
    pub delay_sent: bool,

    /// Reminder cadence in minutes; 0 selects the default cadence.
    pub reminder_interval: i32,
    pub reminder_waiting: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceComplianceRecord {
    /// A freshly tracked device that has not been contacted yet.
    pub fn new_tracked(serial_number: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            serial_number: serial_number.into(),
            created_at: now,
            updated_at: now,
            ..Default::default()
        }
    }

    pub fn state(&self) -> ComplianceState {
        ComplianceState::of(self)
    }

    pub fn has_manager(&self) -> bool {
        !self.manager_id.is_empty()
    }

    /// The owner's fixed-offset timezone.
    pub fn locale(&self) -> FixedOffset {
        clock::fixed_offset(self.tz_offset)
    }

    /// Display name, falling back to the email when no name is known.
    pub fn display_name(&self) -> &str {
        if self.full_name.is_empty() {
            &self.user_email
        } else {
            &self.full_name
        }
    }
}

/// Escalation state of a device. `Untracked` means no record exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceState {
    Untracked,
    AwaitingFirstSend,
    FirstSent,
    Acknowledged,
    ManagerNotified,
}

impl ComplianceState {
    /// Derive the state from a record's flags.
    ///
    /// A manager flag without a delivered first message does not count as
    /// escalated: the record is still waiting for its first send.
    pub fn of(record: &DeviceComplianceRecord) -> Self {
        if !record.first_message_sent {
            ComplianceState::AwaitingFirstSend
        } else if record.manager_message_sent {
            ComplianceState::ManagerNotified
        } else if record.first_ack {
            ComplianceState::Acknowledged
        } else {
            ComplianceState::FirstSent
        }
    }
}

impl fmt::Display for ComplianceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComplianceState::Untracked => "untracked",
            ComplianceState::AwaitingFirstSend => "awaiting_first_send",
            ComplianceState::FirstSent => "first_sent",
            ComplianceState::Acknowledged => "acknowledged",
            ComplianceState::ManagerNotified => "manager_notified",
        };
        f.write_str(s)
    }
}

/// Partial update of a record's mutable fields. `None` leaves a field as is;
/// timestamps are set-only and never cleared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    pub manager_id: Option<String>,
    pub os_version: Option<String>,
    pub first_message_waiting: Option<bool>,
    pub first_message_sent: Option<bool>,
    pub first_message_sent_at: Option<DateTime<Utc>>,
    pub first_ack: Option<bool>,
    pub first_ack_time: Option<DateTime<Utc>>,
    pub manager_message_sent: Option<bool>,
    pub manager_message_sent_at: Option<DateTime<Utc>>,
    pub delay_sent: Option<bool>,
    pub reminder_interval: Option<i32>,
    pub reminder_waiting: Option<bool>,
}

impl RecordUpdate {
    /// First message delivered: sets the sent flag and clears the waiting flag.
    pub fn first_message_delivered(at: DateTime<Utc>) -> Self {
        Self {
            first_message_waiting: Some(false),
            first_message_sent: Some(true),
            first_message_sent_at: Some(at),
            ..Default::default()
        }
    }

    /// First message attempt failed; release the waiting flag for a later tick.
    pub fn release_first_message() -> Self {
        Self {
            first_message_waiting: Some(false),
            ..Default::default()
        }
    }

    pub fn acknowledged(at: DateTime<Utc>) -> Self {
        Self {
            first_ack: Some(true),
            first_ack_time: Some(at),
            ..Default::default()
        }
    }

    pub fn manager_notified(at: DateTime<Utc>) -> Self {
        Self {
            manager_message_sent: Some(true),
            manager_message_sent_at: Some(at),
            ..Default::default()
        }
    }

    pub fn release_reminder() -> Self {
        Self {
            reminder_waiting: Some(false),
            ..Default::default()
        }
    }

    pub fn delay_sent(sent: bool) -> Self {
        Self {
            delay_sent: Some(sent),
            ..Default::default()
        }
    }

    pub fn manager(manager_id: impl Into<String>) -> Self {
        Self {
            manager_id: Some(manager_id.into()),
            ..Default::default()
        }
    }

    pub fn os_version(version: impl Into<String>) -> Self {
        Self {
            os_version: Some(version.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply this update to an in-memory record, bumping `updated_at`.
    pub fn apply(&self, record: &mut DeviceComplianceRecord, now: DateTime<Utc>) {
        if let Some(v) = &self.manager_id {
            record.manager_id = v.clone();
        }
        if let Some(v) = &self.os_version {
            record.os_version = v.clone();
        }
        if let Some(v) = self.first_message_waiting {
            record.first_message_waiting = v;
        }
        if let Some(v) = self.first_message_sent {
            record.first_message_sent = v;
        }
        if let Some(v) = self.first_message_sent_at {
            record.first_message_sent_at = Some(v);
        }
        if let Some(v) = self.first_ack {
            record.first_ack = v;
        }
        if let Some(v) = self.first_ack_time {
            record.first_ack_time = Some(v);
        }
        if let Some(v) = self.manager_message_sent {
            record.manager_message_sent = v;
        }
        if let Some(v) = self.manager_message_sent_at {
            record.manager_message_sent_at = Some(v);
        }
        if let Some(v) = self.delay_sent {
            record.delay_sent = v;
        }
        if let Some(v) = self.reminder_interval {
            record.reminder_interval = v;
        }
        if let Some(v) = self.reminder_waiting {
            record.reminder_waiting = v;
        }
        record.updated_at = now;
    }
}
