//! Persistence for tracked compliance records.
//!
//! - [`ComplianceStore`]: the store contract used by the escalation engine
//! - [`PgStore`]: PostgreSQL backend with embedded migrations
//! - [`MemoryStore`]: in-process backend for dry runs and tests

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::ComplianceStore;
