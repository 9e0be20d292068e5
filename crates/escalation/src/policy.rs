//! The escalation policy contract and policy selection.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use laggard_connector::IdentityProvider;
use laggard_core::config::PolicyKind;
use laggard_core::DeviceComplianceRecord;
use laggard_notify::{Message, MessageTemplates};

use crate::cadence::CadencePolicy;
use crate::error::EscalationError;
use crate::interval::IntervalBucketPolicy;
use crate::messenger::Messenger;

/// What one pass over the tracked set did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Records looked at.
    pub examined: usize,
    /// Sends dispatched or scheduled.
    pub dispatched: usize,
    /// Records skipped because a collaborator call failed.
    pub failed: usize,
}

impl TickReport {
    pub fn summary(&self) -> String {
        format!(
            "examined {}, dispatched {}, failed {}",
            self.examined, self.dispatched, self.failed
        )
    }
}

/// A strategy deciding when and to whom each tracked device is escalated.
///
/// `check` drives every transition after the first send is due; each call
/// takes at most one side-effecting action per device and is safe to repeat
/// while a waiting flag is held.
#[async_trait]
pub trait EscalationPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self, now: DateTime<Utc>) -> Result<TickReport, EscalationError>;

    /// Continuous-cadence maintenance.
    async fn poll(&self, _now: DateTime<Utc>) -> Result<TickReport, EscalationError> {
        Ok(TickReport::default())
    }

    /// Forget devices that are no longer tracked.
    async fn device_diff(&self, retired: &[String]);

    async fn first_message(
        &self,
        record: &DeviceComplianceRecord,
    ) -> Result<Message, EscalationError>;

    async fn reminder_message(
        &self,
        record: &DeviceComplianceRecord,
    ) -> Result<Message, EscalationError>;

    /// Best-effort manager resolution for newly tracked devices.
    async fn table_associations(&self, _serials: &[String]) -> Result<(), EscalationError> {
        Ok(())
    }

    /// Called once when the deadline has passed.
    async fn on_deadline(&self, now: DateTime<Utc>) -> Result<(), EscalationError>;
}

pub fn templates_for(kind: PolicyKind) -> MessageTemplates {
    match kind {
        PolicyKind::Cadence => MessageTemplates::cadence(),
        PolicyKind::Interval => MessageTemplates::interval(),
    }
}

/// Build the configured policy. The cadence policy needs a directory.
pub fn build_policy(
    kind: PolicyKind,
    messenger: Arc<Messenger>,
    identity: Option<Arc<dyn IdentityProvider>>,
) -> Result<Arc<dyn EscalationPolicy>, EscalationError> {
    match kind {
        PolicyKind::Cadence => {
            let identity = identity.ok_or_else(|| {
                EscalationError::Config("the cadence policy needs an identity provider".into())
            })?;
            Ok(Arc::new(CadencePolicy::new(messenger, identity)))
        }
        PolicyKind::Interval => Ok(Arc::new(IntervalBucketPolicy::new(messenger))),
    }
}
