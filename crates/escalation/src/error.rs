use laggard_connector::ConnectorError;
use laggard_core::{CoreError, VersionError};
use laggard_notify::NotifyError;
use laggard_storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("notify: {0}")]
    Notify(#[from] NotifyError),
    #[error("provider: {0}")]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("version: {0}")]
    Version(#[from] VersionError),
    #[error("policy misconfigured: {0}")]
    Config(String),
}
