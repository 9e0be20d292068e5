//! Shared fixtures for the escalation tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use laggard_connector::{ConnectorError, IdentityProvider, InventoryProvider};
use laggard_core::config::{EngineSettings, PolicyKind};
use laggard_core::{DeviceComplianceRecord, InventoryDevice, Person};
use laggard_notify::{ChatUser, Delivery, Message, MessageTemplates, Notifier, NotifyError};
use laggard_storage::MemoryStore;

use crate::messenger::Messenger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentKind {
    Direct,
    Between,
    Channel,
}

#[derive(Debug, Clone)]
pub struct Sent {
    pub kind: SentKind,
    pub target: String,
    pub message: Message,
}

/// Records every outbound message; can be told to fail.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Sent>>,
    fail: AtomicBool,
    users: Mutex<HashMap<String, ChatUser>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn add_user(&self, email: &str, id: &str, tz_offset: i32) {
        self.users.lock().unwrap().insert(
            email.to_string(),
            ChatUser {
                id: id.to_string(),
                real_name: String::new(),
                tz_offset,
            },
        );
    }

    fn record(&self, kind: SentKind, target: String, message: &Message) -> Result<Delivery, NotifyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Api("channel_not_found (HTTP 200 OK)".into()));
        }
        self.sent.lock().unwrap().push(Sent {
            kind,
            target: target.clone(),
            message: message.clone(),
        });
        Ok(Delivery {
            channel: target,
            sent_at: Utc::now(),
        })
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_direct(&self, user_id: &str, message: &Message) -> Result<Delivery, NotifyError> {
        self.record(SentKind::Direct, user_id.to_string(), message)
    }

    async fn send_between(
        &self,
        user_ids: &[String],
        message: &Message,
    ) -> Result<Delivery, NotifyError> {
        self.record(SentKind::Between, user_ids.join(","), message)
    }

    async fn post_channel(&self, channel: &str, message: &Message) -> Result<Delivery, NotifyError> {
        self.record(SentKind::Channel, channel.to_string(), message)
    }

    async fn lookup_user_by_email(&self, email: &str) -> Result<Option<ChatUser>, NotifyError> {
        Ok(self.users.lock().unwrap().get(email).cloned())
    }

    fn channel_name(&self) -> &str {
        "recording"
    }
}

#[derive(Default)]
pub struct StaticInventory {
    pub devices: Mutex<Vec<InventoryDevice>>,
}

impl StaticInventory {
    pub fn set(&self, devices: Vec<InventoryDevice>) {
        *self.devices.lock().unwrap() = devices;
    }
}

#[async_trait]
impl InventoryProvider for StaticInventory {
    async fn list_all(&self) -> Result<Vec<InventoryDevice>, ConnectorError> {
        Ok(self.devices.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct StaticDirectory {
    pub people: Vec<Person>,
}

#[async_trait]
impl IdentityProvider for StaticDirectory {
    async fn list_all_people(&self) -> Result<Vec<Person>, ConnectorError> {
        Ok(self.people.clone())
    }
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        required_version: "13.4.1".into(),
        deadline: "06-30-2024".into(),
        alert_channel: Some("C-ALERTS".into()),
        ..Default::default()
    }
}

pub fn record(serial: &str) -> DeviceComplianceRecord {
    let mut r = DeviceComplianceRecord::new_tracked(serial, Utc::now());
    r.user_id = format!("U-{serial}");
    r.user_email = format!("{}@example.com", serial.to_lowercase());
    r.full_name = "Frodo Baggins".into();
    r.os_version = "13.2".into();
    r.model = "MacBook Pro".into();
    r.platform = "Mac".into();
    r
}

pub fn device(serial: &str, version: &str) -> InventoryDevice {
    InventoryDevice {
        serial_number: serial.into(),
        os_version: version.into(),
        platform: "Mac".into(),
        owner_email: format!("{}@example.com", serial.to_lowercase()),
        owner_id: format!("kandji-{serial}"),
        owner_name: "Frodo Baggins".into(),
        device_name: format!("{serial}-mbp"),
        model: "MacBook Pro".into(),
    }
}

/// Store, notifier and a zero-jitter messenger wired together.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub settings: Arc<RwLock<EngineSettings>>,
    pub messenger: Arc<Messenger>,
}

impl Harness {
    pub fn new(
        settings: EngineSettings,
        records: impl IntoIterator<Item = DeviceComplianceRecord>,
    ) -> Self {
        let templates = match settings.policy {
            PolicyKind::Cadence => MessageTemplates::cadence(),
            PolicyKind::Interval => MessageTemplates::interval(),
        };
        let store = Arc::new(MemoryStore::with_records(records));
        let notifier = Arc::new(RecordingNotifier::default());
        let settings = Arc::new(RwLock::new(settings));
        let messenger = Arc::new(
            Messenger::new(store.clone(), notifier.clone(), settings.clone(), templates)
                .with_jitter(Duration::ZERO, Duration::ZERO),
        );
        Self {
            store,
            notifier,
            settings,
            messenger,
        }
    }

    pub fn cadence(
        mut settings: EngineSettings,
        records: impl IntoIterator<Item = DeviceComplianceRecord>,
    ) -> Self {
        settings.policy = PolicyKind::Cadence;
        Self::new(settings, records)
    }

    pub fn interval(
        mut settings: EngineSettings,
        records: impl IntoIterator<Item = DeviceComplianceRecord>,
    ) -> Self {
        settings.policy = PolicyKind::Interval;
        Self::new(settings, records)
    }
}
