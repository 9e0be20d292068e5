use std::sync::Arc;

use laggard_escalation::StatusHandler;
use laggard_storage::ComplianceStore;

use crate::lifecycle::LifecycleHandle;

/// Shared handler state.
pub struct AppState {
    pub status: Arc<StatusHandler>,
    pub store: Arc<dyn ComplianceStore>,
    pub lifecycle: LifecycleHandle,
    /// Bearer token for `/control/*`; `None` disables those routes.
    pub control_token: Option<String>,
    /// Redacted configuration for `/status`.
    pub config_summary: serde_json::Value,
}
