//! The compliance store contract shared by the Postgres and in-memory backends.

use laggard_core::{DeviceComplianceRecord, Exclusion, RecordUpdate};

use crate::error::StoreError;

/// Durable table of per-device compliance records.
///
/// The `claim_*` methods are atomic compare-and-set operations: they flip a
/// waiting flag from false to true and report whether this caller won. They
/// are the only way the engine marks a send as in flight.
#[async_trait::async_trait]
pub trait ComplianceStore: Send + Sync {
    /// All tracked records.
    async fn get_tracked(&self) -> Result<Vec<DeviceComplianceRecord>, StoreError>;

    async fn get_by_serial(&self, serial: &str)
        -> Result<Option<DeviceComplianceRecord>, StoreError>;

    /// Apply a partial update. Fails with [`StoreError::NotFound`] for an
    /// unknown serial.
    async fn update_flags(&self, serial: &str, update: &RecordUpdate) -> Result<(), StoreError>;

    /// Insert new records, or refresh the identity and device snapshot of
    /// existing ones. Escalation flags of existing records are untouched.
    async fn bulk_upsert(&self, records: &[DeviceComplianceRecord]) -> Result<usize, StoreError>;

    /// Remove records; returns how many existed.
    async fn delete(&self, serials: &[String]) -> Result<u64, StoreError>;

    /// Records with no manager id.
    async fn get_association_gaps(&self) -> Result<Vec<DeviceComplianceRecord>, StoreError>;

    /// Mark the first message in flight. False when it is already waiting,
    /// already sent, or the record is gone.
    async fn claim_first_message(&self, serial: &str) -> Result<bool, StoreError>;

    /// Mark a cadence reminder in flight. False when one is already waiting.
    async fn claim_reminder(&self, serial: &str) -> Result<bool, StoreError>;

    /// Mark the ad-hoc reminder as sent. False when none is set or it was
    /// already claimed.
    async fn claim_delay(&self, serial: &str) -> Result<bool, StoreError>;

    async fn is_excluded(&self, serial: &str) -> Result<Option<Exclusion>, StoreError>;

    /// Connectivity probe for status reporting.
    async fn ping(&self) -> Result<(), StoreError>;
}
