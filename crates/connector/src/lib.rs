//! Clients for the fleet's sources of truth: the device inventory (MDM) and
//! the identity provider (directory).

pub mod error;
pub mod identity;
pub mod inventory;

pub use error::ConnectorError;
pub use identity::{IdentityProvider, OktaClient};
pub use inventory::{InventoryProvider, KandjiClient};
