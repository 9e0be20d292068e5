pub mod clock;
pub mod config;
pub mod error;
pub mod fleet;
pub mod record;
pub mod version;

pub use config::Config;
pub use error::*;
pub use fleet::*;
pub use record::*;
pub use version::{meets_requirement, OsVersion, VersionError};
