use thiserror::Error;

use crate::version::VersionError;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Version error: {0}")]
    Version(#[from] VersionError),

    #[error("Invalid date/time {input:?}: {reason}")]
    DateTime { input: String, reason: String },

    #[error("{0}")]
    Other(String),
}
