//! Keeps the tracked set in step with inventory: start tracking devices that
//! fall below the required version, stop tracking devices that meet it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::FutureExt;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use laggard_connector::InventoryProvider;
use laggard_core::config::EngineSettings;
use laggard_core::{DeviceComplianceRecord, InventoryDevice, OsVersion, RecordUpdate};
use laggard_notify::Notifier;
use laggard_storage::ComplianceStore;

use crate::error::EscalationError;
use crate::policy::EscalationPolicy;

/// Concurrent chat lookups while building new records.
const OWNER_LOOKUP_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Serials newly tracked.
    pub added: Vec<String>,
    /// Serials that reached compliance and were untracked.
    pub removed: Vec<String>,
    /// Devices skipped for bad data (malformed version).
    pub skipped: usize,
    /// Tracked devices whose reported version changed.
    pub refreshed: usize,
    /// Devices left as they were because a store call failed.
    pub failed: usize,
}

impl ReconcileReport {
    pub fn summary(&self) -> String {
        format!(
            "added {}, removed {}, skipped {}, refreshed {}, failed {}",
            self.added.len(),
            self.removed.len(),
            self.skipped,
            self.refreshed,
            self.failed
        )
    }
}

pub struct FleetReconciler {
    inventory: Arc<dyn InventoryProvider>,
    store: Arc<dyn ComplianceStore>,
    notifier: Arc<dyn Notifier>,
    settings: Arc<RwLock<EngineSettings>>,
}

impl FleetReconciler {
    pub fn new(
        inventory: Arc<dyn InventoryProvider>,
        store: Arc<dyn ComplianceStore>,
        notifier: Arc<dyn Notifier>,
        settings: Arc<RwLock<EngineSettings>>,
    ) -> Self {
        Self {
            inventory,
            store,
            notifier,
            settings,
        }
    }

    /// One reconciliation pass. Retired serials go to `policy.device_diff`,
    /// newly tracked ones to `policy.table_associations`.
    pub async fn reconcile(
        &self,
        policy: &dyn EscalationPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, EscalationError> {
        let settings = self.settings.read().await.clone();
        let required: OsVersion = settings.required_version.parse()?;

        let devices = self.inventory.list_all().await?;
        let tracked: HashMap<String, DeviceComplianceRecord> = self
            .store
            .get_tracked()
            .await?
            .into_iter()
            .map(|r| (r.serial_number.clone(), r))
            .collect();

        let mut report = ReconcileReport::default();
        let mut lagging = Vec::new();

        for device in &devices {
            if device.serial_number.is_empty() || !device.is_supported(&settings.supported_platforms)
            {
                continue;
            }
            let reported: OsVersion = match device.os_version.parse() {
                Ok(v) => v,
                Err(e) => {
                    warn!(serial = %device.serial_number, version = %device.os_version, error = %e, "skipping device with malformed version");
                    report.skipped += 1;
                    continue;
                }
            };
            let compliant = reported.satisfies(&required);

            match tracked.get(&device.serial_number) {
                Some(_) if compliant => report.removed.push(device.serial_number.clone()),
                Some(record) => {
                    if record.os_version == device.os_version {
                        continue;
                    }
                    let update = RecordUpdate::os_version(device.os_version.as_str());
                    match self.store.update_flags(&device.serial_number, &update).await {
                        Ok(()) => report.refreshed += 1,
                        Err(e) => {
                            warn!(serial = %device.serial_number, error = %e, "could not refresh os version");
                            report.failed += 1;
                        }
                    }
                }
                None if compliant => {}
                None => {
                    if device.owner_email.is_empty() && device.owner_id.is_empty() {
                        debug!(serial = %device.serial_number, "lagging device has no owner, not tracking");
                        continue;
                    }
                    lagging.push(device);
                }
            }
        }

        let pending: Vec<_> = lagging
            .into_iter()
            .map(|device| self.new_record(device, now).boxed())
            .collect();
        let to_add: Vec<DeviceComplianceRecord> = stream::iter(pending)
            .buffered(OWNER_LOOKUP_CONCURRENCY)
            .collect()
            .await;
        if !to_add.is_empty() {
            self.store.bulk_upsert(&to_add).await?;
            report.added = to_add.into_iter().map(|r| r.serial_number).collect();
        }
        if !report.removed.is_empty() {
            self.store.delete(&report.removed).await?;
            policy.device_diff(&report.removed).await;
        }
        if !report.added.is_empty() {
            if let Err(e) = policy.table_associations(&report.added).await {
                warn!(error = %e, "manager association failed");
            }
        }

        info!(report = %report.summary(), "fleet reconciled");
        Ok(report)
    }

    /// A fresh record for a lagging device, with the owner's chat identity
    /// when the chat platform knows the email.
    async fn new_record(&self, device: &InventoryDevice, now: DateTime<Utc>) -> DeviceComplianceRecord {
        let mut record = DeviceComplianceRecord::new_tracked(device.serial_number.clone(), now);
        record.user_email = device.owner_email.clone();
        record.full_name = device.owner_name.clone();
        record.user_id = device.owner_id.clone();
        record.os_version = device.os_version.clone();
        record.model = device.model.clone();
        record.platform = device.platform.clone();

        if device.owner_email.is_empty() {
            return record;
        }
        match self.notifier.lookup_user_by_email(&device.owner_email).await {
            Ok(Some(user)) => {
                record.user_id = user.id;
                record.tz_offset = user.tz_offset;
                if record.full_name.is_empty() {
                    record.full_name = user.real_name;
                }
            }
            Ok(None) => {
                debug!(serial = %device.serial_number, email = %device.owner_email, "owner not found in chat, using inventory id");
            }
            Err(e) => {
                warn!(serial = %device.serial_number, email = %device.owner_email, error = %e, "owner lookup failed, using inventory id");
            }
        }
        record
    }
}
