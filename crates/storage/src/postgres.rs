//! PostgreSQL-backed [`ComplianceStore`].

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info};

use laggard_core::config::PostgresConfig;
use laggard_core::{DeviceComplianceRecord, Exclusion, RecordUpdate};

use crate::error::StoreError;
use crate::store::ComplianceStore;

const RECORD_COLUMNS: &str = "serial_number, user_id, manager_id, user_email, full_name, \
     tz_offset, os_version, model, platform, \
     first_message_waiting, first_message_sent, first_message_sent_at, \
     first_ack, first_ack_time, manager_message_sent, manager_message_sent_at, \
     delay_at, delay_date, delay_time, delay_sent, \
     reminder_interval, reminder_waiting, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    serial_number: String,
    user_id: String,
    manager_id: String,
    user_email: String,
    full_name: String,
    tz_offset: i32,
    os_version: String,
    model: String,
    platform: String,
    first_message_waiting: bool,
    first_message_sent: bool,
    first_message_sent_at: Option<DateTime<Utc>>,
    first_ack: bool,
    first_ack_time: Option<DateTime<Utc>>,
    manager_message_sent: bool,
    manager_message_sent_at: Option<DateTime<Utc>>,
    delay_at: Option<DateTime<Utc>>,
    delay_date: Option<String>,
    delay_time: Option<String>,
    delay_sent: bool,
    reminder_interval: i32,
    reminder_waiting: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RecordRow> for DeviceComplianceRecord {
    fn from(r: RecordRow) -> Self {
        Self {
            serial_number: r.serial_number,
            user_id: r.user_id,
            manager_id: r.manager_id,
            user_email: r.user_email,
            full_name: r.full_name,
            tz_offset: r.tz_offset,
            os_version: r.os_version,
            model: r.model,
            platform: r.platform,
            first_message_waiting: r.first_message_waiting,
            first_message_sent: r.first_message_sent,
            first_message_sent_at: r.first_message_sent_at,
            first_ack: r.first_ack,
            first_ack_time: r.first_ack_time,
            manager_message_sent: r.manager_message_sent,
            manager_message_sent_at: r.manager_message_sent_at,
            delay_at: r.delay_at,
            delay_date: r.delay_date,
            delay_time: r.delay_time,
            delay_sent: r.delay_sent,
            reminder_interval: r.reminder_interval,
            reminder_waiting: r.reminder_waiting,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ExclusionRow {
    serial_number: String,
    reason: String,
    approved: bool,
    until: Option<DateTime<Utc>>,
}

/// Compliance records stored in the `compliance_records` table.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run the embedded migrations.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        if !config.is_configured() {
            return Err(StoreError::NotConfigured(
                "set PG_URL or PG_USER/PG_PASSWORD".into(),
            ));
        }
        let pool = PgPool::connect(&config.database_url()).await?;
        info!("PostgreSQL connected: {}", config.host);
        sqlx::migrate!("../../migrations").run(&pool).await?;
        info!("Database migrations applied successfully");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl ComplianceStore for PgStore {
    async fn get_tracked(&self) -> Result<Vec<DeviceComplianceRecord>, StoreError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM compliance_records ORDER BY serial_number");
        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_by_serial(
        &self,
        serial: &str,
    ) -> Result<Option<DeviceComplianceRecord>, StoreError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM compliance_records WHERE serial_number = $1");
        let row = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(serial)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn update_flags(&self, serial: &str, update: &RecordUpdate) -> Result<(), StoreError> {
        if update.is_empty() {
            return Ok(());
        }
        let result = sqlx::query(
            "UPDATE compliance_records SET \
                manager_id              = COALESCE($2, manager_id), \
                os_version              = COALESCE($3, os_version), \
                first_message_waiting   = COALESCE($4, first_message_waiting), \
                first_message_sent      = COALESCE($5, first_message_sent), \
                first_message_sent_at   = COALESCE($6, first_message_sent_at), \
                first_ack               = COALESCE($7, first_ack), \
                first_ack_time          = COALESCE($8, first_ack_time), \
                manager_message_sent    = COALESCE($9, manager_message_sent), \
                manager_message_sent_at = COALESCE($10, manager_message_sent_at), \
                delay_sent              = COALESCE($11, delay_sent), \
                reminder_interval       = COALESCE($12, reminder_interval), \
                reminder_waiting        = COALESCE($13, reminder_waiting), \
                updated_at              = now() \
             WHERE serial_number = $1",
        )
        .bind(serial)
        .bind(&update.manager_id)
        .bind(&update.os_version)
        .bind(update.first_message_waiting)
        .bind(update.first_message_sent)
        .bind(update.first_message_sent_at)
        .bind(update.first_ack)
        .bind(update.first_ack_time)
        .bind(update.manager_message_sent)
        .bind(update.manager_message_sent_at)
        .bind(update.delay_sent)
        .bind(update.reminder_interval)
        .bind(update.reminder_waiting)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(serial.to_string()));
        }
        Ok(())
    }

    async fn bulk_upsert(&self, records: &[DeviceComplianceRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut count = 0usize;
        for r in records {
            let result = sqlx::query(
                "INSERT INTO compliance_records \
                    (serial_number, user_id, manager_id, user_email, full_name, tz_offset, \
                     os_version, model, platform, reminder_interval) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (serial_number) DO UPDATE SET \
                    user_id    = EXCLUDED.user_id, \
                    user_email = EXCLUDED.user_email, \
                    full_name  = EXCLUDED.full_name, \
                    tz_offset  = EXCLUDED.tz_offset, \
                    os_version = EXCLUDED.os_version, \
                    model      = EXCLUDED.model, \
                    platform   = EXCLUDED.platform, \
                    manager_id = CASE WHEN EXCLUDED.manager_id = '' \
                                      THEN compliance_records.manager_id \
                                      ELSE EXCLUDED.manager_id END, \
                    updated_at = now()",
            )
            .bind(&r.serial_number)
            .bind(&r.user_id)
            .bind(&r.manager_id)
            .bind(&r.user_email)
            .bind(&r.full_name)
            .bind(r.tz_offset)
            .bind(&r.os_version)
            .bind(&r.model)
            .bind(&r.platform)
            .bind(r.reminder_interval)
            .execute(&mut *tx)
            .await?;
            count += result.rows_affected() as usize;
        }
        tx.commit().await?;
        debug!(count, "upserted compliance records");
        Ok(count)
    }

    async fn delete(&self, serials: &[String]) -> Result<u64, StoreError> {
        if serials.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM compliance_records WHERE serial_number = ANY($1)")
            .bind(serials)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_association_gaps(&self) -> Result<Vec<DeviceComplianceRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM compliance_records \
             WHERE manager_id = '' ORDER BY serial_number"
        );
        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn claim_first_message(&self, serial: &str) -> Result<bool, StoreError> {
        let claimed = sqlx::query_scalar::<_, String>(
            "UPDATE compliance_records SET first_message_waiting = TRUE, updated_at = now() \
             WHERE serial_number = $1 \
               AND first_message_waiting = FALSE \
               AND first_message_sent = FALSE \
             RETURNING serial_number",
        )
        .bind(serial)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.is_some())
    }

    async fn claim_reminder(&self, serial: &str) -> Result<bool, StoreError> {
        let claimed = sqlx::query_scalar::<_, String>(
            "UPDATE compliance_records SET reminder_waiting = TRUE, updated_at = now() \
             WHERE serial_number = $1 AND reminder_waiting = FALSE \
             RETURNING serial_number",
        )
        .bind(serial)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.is_some())
    }

    async fn claim_delay(&self, serial: &str) -> Result<bool, StoreError> {
        let claimed = sqlx::query_scalar::<_, String>(
            "UPDATE compliance_records SET delay_sent = TRUE, updated_at = now() \
             WHERE serial_number = $1 AND delay_at IS NOT NULL AND delay_sent = FALSE \
             RETURNING serial_number",
        )
        .bind(serial)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.is_some())
    }

    async fn is_excluded(&self, serial: &str) -> Result<Option<Exclusion>, StoreError> {
        let row = sqlx::query_as::<_, ExclusionRow>(
            "SELECT serial_number, reason, approved, until FROM exclusions WHERE serial_number = $1",
        )
        .bind(serial)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Exclusion {
            serial_number: r.serial_number,
            reason: r.reason,
            approved: r.approved,
            until: r.until,
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
