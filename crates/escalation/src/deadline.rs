//! One-shot trigger for the update deadline.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use laggard_core::config::EngineSettings;

use crate::error::EscalationError;
use crate::policy::EscalationPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineOutcome {
    Pending,
    /// The deadline passed on this check; the policy was told.
    Passed,
    AlreadyFired,
}

#[derive(Debug, Default)]
pub struct DeadlineCheck {
    fired: AtomicBool,
}

impl DeadlineCheck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Re-arm after a reload moves the deadline.
    pub fn reset(&self) {
        self.fired.store(false, Ordering::SeqCst);
    }

    pub async fn check(
        &self,
        settings: &EngineSettings,
        policy: &dyn EscalationPolicy,
        now: DateTime<Utc>,
    ) -> Result<DeadlineOutcome, EscalationError> {
        let deadline = settings.deadline_at()?;
        if now <= deadline {
            return Ok(DeadlineOutcome::Pending);
        }
        if self.fired.swap(true, Ordering::SeqCst) {
            return Ok(DeadlineOutcome::AlreadyFired);
        }

        info!(deadline = %deadline, policy = policy.name(), "update deadline passed");
        if let Err(e) = policy.on_deadline(now).await {
            warn!(error = %e, "deadline handler failed");
        }
        Ok(DeadlineOutcome::Passed)
    }
}
