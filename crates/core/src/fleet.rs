//! Shapes exchanged with the inventory and identity providers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A managed device as reported by the inventory provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventoryDevice {
    pub serial_number: String,
    pub os_version: String,
    pub platform: String,
    pub owner_email: String,
    pub owner_id: String,
    #[serde(default)]
    pub owner_name: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub model: String,
}

impl InventoryDevice {
    /// Case-insensitive platform match against an allowlist.
    pub fn is_supported(&self, platforms: &[String]) -> bool {
        let platform = self.platform.trim();
        platforms.iter().any(|p| p.eq_ignore_ascii_case(platform))
    }
}

/// A person from the identity provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub email: String,
    /// Email of this person's manager (empty when none is set).
    pub manager_email: String,
    pub first_name: String,
    pub last_name: String,
}

impl Person {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// An exclusion request for a device. Only approved exclusions suppress sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    pub serial_number: String,
    pub reason: String,
    pub approved: bool,
    pub until: Option<DateTime<Utc>>,
}

impl Exclusion {
    /// Approved and not yet expired at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.approved && self.until.map_or(true, |until| now < until)
    }
}
