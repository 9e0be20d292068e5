//! In-process [`ComplianceStore`] for dry runs and tests.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use tokio::sync::RwLock;

use laggard_core::{DeviceComplianceRecord, Exclusion, RecordUpdate};

use crate::error::StoreError;
use crate::store::ComplianceStore;

/// Records keyed by serial, behind a single async lock so every claim is a
/// read-modify-write under the write guard.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, DeviceComplianceRecord>>,
    exclusions: RwLock<HashMap<String, Exclusion>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with records.
    pub fn with_records(records: impl IntoIterator<Item = DeviceComplianceRecord>) -> Self {
        let map = records
            .into_iter()
            .map(|r| (r.serial_number.clone(), r))
            .collect();
        Self {
            records: RwLock::new(map),
            exclusions: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a full record, flags included.
    pub async fn put(&self, record: DeviceComplianceRecord) {
        self.records
            .write()
            .await
            .insert(record.serial_number.clone(), record);
    }

    pub async fn put_exclusion(&self, exclusion: Exclusion) {
        self.exclusions
            .write()
            .await
            .insert(exclusion.serial_number.clone(), exclusion);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn claim<F>(&self, serial: &str, claim: F) -> bool
    where
        F: FnOnce(&mut DeviceComplianceRecord) -> bool,
    {
        let mut records = self.records.write().await;
        match records.get_mut(serial) {
            Some(record) => {
                let won = claim(record);
                if won {
                    record.updated_at = Utc::now();
                }
                won
            }
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl ComplianceStore for MemoryStore {
    async fn get_tracked(&self) -> Result<Vec<DeviceComplianceRecord>, StoreError> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn get_by_serial(
        &self,
        serial: &str,
    ) -> Result<Option<DeviceComplianceRecord>, StoreError> {
        Ok(self.records.read().await.get(serial).cloned())
    }

    async fn update_flags(&self, serial: &str, update: &RecordUpdate) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(serial)
            .ok_or_else(|| StoreError::NotFound(serial.to_string()))?;
        update.apply(record, Utc::now());
        Ok(())
    }

    async fn bulk_upsert(&self, incoming: &[DeviceComplianceRecord]) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        for r in incoming {
            match records.get_mut(&r.serial_number) {
                Some(existing) => {
                    existing.user_id = r.user_id.clone();
                    existing.user_email = r.user_email.clone();
                    existing.full_name = r.full_name.clone();
                    existing.tz_offset = r.tz_offset;
                    existing.os_version = r.os_version.clone();
                    existing.model = r.model.clone();
                    existing.platform = r.platform.clone();
                    if !r.manager_id.is_empty() {
                        existing.manager_id = r.manager_id.clone();
                    }
                    existing.updated_at = now;
                }
                None => {
                    let mut fresh = DeviceComplianceRecord::new_tracked(r.serial_number.clone(), now);
                    fresh.user_id = r.user_id.clone();
                    fresh.manager_id = r.manager_id.clone();
                    fresh.user_email = r.user_email.clone();
                    fresh.full_name = r.full_name.clone();
                    fresh.tz_offset = r.tz_offset;
                    fresh.os_version = r.os_version.clone();
                    fresh.model = r.model.clone();
                    fresh.platform = r.platform.clone();
                    fresh.reminder_interval = r.reminder_interval;
                    records.insert(fresh.serial_number.clone(), fresh);
                }
            }
        }
        Ok(incoming.len())
    }

    async fn delete(&self, serials: &[String]) -> Result<u64, StoreError> {
        let mut records = self.records.write().await;
        let removed = serials
            .iter()
            .filter(|s| records.remove(s.as_str()).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn get_association_gaps(&self) -> Result<Vec<DeviceComplianceRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| !r.has_manager())
            .cloned()
            .collect())
    }

    async fn claim_first_message(&self, serial: &str) -> Result<bool, StoreError> {
        Ok(self
            .claim(serial, |r| {
                if r.first_message_waiting || r.first_message_sent {
                    return false;
                }
                r.first_message_waiting = true;
                true
            })
            .await)
    }

    async fn claim_reminder(&self, serial: &str) -> Result<bool, StoreError> {
        Ok(self
            .claim(serial, |r| {
                if r.reminder_waiting {
                    return false;
                }
                r.reminder_waiting = true;
                true
            })
            .await)
    }

    async fn claim_delay(&self, serial: &str) -> Result<bool, StoreError> {
        Ok(self
            .claim(serial, |r| {
                if r.delay_at.is_none() || r.delay_sent {
                    return false;
                }
                r.delay_sent = true;
                true
            })
            .await)
    }

    async fn is_excluded(&self, serial: &str) -> Result<Option<Exclusion>, StoreError> {
        Ok(self.exclusions.read().await.get(serial).cloned())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
