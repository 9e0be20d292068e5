use std::sync::Arc;

use tracing::{info, warn};

use laggard_core::config::PostgresConfig;
use laggard_storage::{ComplianceStore, MemoryStore, PgStore};

/// Open the record store: PostgreSQL (with migrations) unless `memory` is
/// set. A configured but unreachable database is fatal.
pub async fn init_store(
    config: &PostgresConfig,
    memory: bool,
) -> anyhow::Result<Arc<dyn ComplianceStore>> {
    if memory {
        warn!("using the in-memory store; records are lost on exit");
        return Ok(Arc::new(MemoryStore::new()));
    }
    if !config.is_configured() {
        anyhow::bail!("PG_URL or PG_USER/PG_PASSWORD must be set (or pass --memory-store)");
    }
    let store = PgStore::connect(config).await?;
    info!(host = %config.host, db = %config.database, "record store ready");
    Ok(Arc::new(store))
}
