use crate::error::{BrokerError, Result};
use crate::pool::PoolReference;
use crate::resource::{PhaseState, PhaseStatus, ResourceRecord, ResourceType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

const UPDATE_ATTEMPTS: u32 = 3;

/// Persistent store of pooled resource records.
#[async_trait]
pub trait ResourceRepository: Send + Sync {
    async fn create(&self, record: &ResourceRecord) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<ResourceRecord>>;

    /// Writes `record` if nobody else changed it since it was read.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Conflict`] when the stored version moved on.
    async fn update(&self, record: &ResourceRecord) -> Result<ResourceRecord>;

    /// Atomically claims one ready, unassigned, undeleted member of the pool.
    async fn try_get(
        &self,
        pool_code: &str,
        environment_id: &str,
        reason: &str,
    ) -> Result<Option<ResourceRecord>>;

    /// Returns a claimed record to its pool.
    async fn release_get(&self, id: &str) -> Result<()>;

    /// Distinct pool codes that still have unassigned, undeleted members.
    async fn pool_codes_for_unassigned(&self) -> Result<Vec<String>>;

    /// Ids of unassigned, undeleted members of a pool.
    async fn unassigned_in_pool(&self, pool_code: &str) -> Result<Vec<String>>;

    async fn count_unassigned(&self, pool_code: &str) -> Result<i64>;
}

/// Re-reads, mutates and writes a record, retrying on version conflicts.
pub async fn mutate_with_retry<F>(
    repository: &dyn ResourceRepository,
    id: &str,
    mut mutate: F,
) -> Result<ResourceRecord>
where
    F: FnMut(&mut ResourceRecord) + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut record = repository
            .get(id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))?;
        mutate(&mut record);
        match repository.update(&record).await {
            Err(BrokerError::Conflict(_)) if attempt < UPDATE_ATTEMPTS => {
                debug!(resource_id = id, attempt, "Version conflict, retrying update");
            }
            other => return other,
        }
    }
}

#[derive(Clone)]
pub struct SqliteResourceRepository {
    pool: SqlitePool,
}

impl SqliteResourceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn shared(pool: SqlitePool) -> Arc<dyn ResourceRepository> {
        Arc::new(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ResourceRepository for SqliteResourceRepository {
    #[instrument(skip(self, record), fields(resource_id = %record.id))]
    async fn create(&self, record: &ResourceRecord) -> Result<()> {
        let dimensions = serde_json::to_string(&record.pool_reference.dimensions)?;

        sqlx::query(
            r#"
            INSERT INTO resources (
                id, resource_type, sku_name, location, pool_code, pool_version_code, pool_dimensions,
                environment_id, component_of, is_ready, is_assigned, assigned_at, assigned_reason,
                is_deleted, deleted_at,
                provisioning_status, provisioning_changed, provisioning_reason,
                starting_status, starting_changed, starting_reason,
                deleting_status, deleting_changed, deleting_reason,
                cleanup_status, cleanup_changed, cleanup_reason,
                created_at, updated_at, version
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(record.resource_type)
        .bind(&record.sku_name)
        .bind(&record.location)
        .bind(&record.pool_reference.code)
        .bind(&record.pool_reference.version_code)
        .bind(dimensions)
        .bind(&record.environment_id)
        .bind(&record.component_of)
        .bind(record.is_ready)
        .bind(record.is_assigned)
        .bind(record.assigned.map(|dt| dt.timestamp()))
        .bind(&record.assigned_reason)
        .bind(record.is_deleted)
        .bind(record.deleted.map(|dt| dt.timestamp()))
        .bind(record.provisioning.status)
        .bind(record.provisioning.changed.map(|dt| dt.timestamp()))
        .bind(&record.provisioning.reason)
        .bind(record.starting.status)
        .bind(record.starting.changed.map(|dt| dt.timestamp()))
        .bind(&record.starting.reason)
        .bind(record.deleting.status)
        .bind(record.deleting.changed.map(|dt| dt.timestamp()))
        .bind(&record.deleting.reason)
        .bind(record.cleanup.status)
        .bind(record.cleanup.changed.map(|dt| dt.timestamp()))
        .bind(&record.cleanup.reason)
        .bind(record.created.timestamp())
        .bind(record.updated.timestamp())
        .bind(record.version)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ResourceRecord>> {
        let row = sqlx::query_as::<_, ResourceRow>("SELECT * FROM resources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, record), fields(resource_id = %record.id, version = record.version))]
    async fn update(&self, record: &ResourceRecord) -> Result<ResourceRecord> {
        let now = Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE resources SET
                environment_id = ?, component_of = ?, is_ready = ?,
                is_assigned = ?, assigned_at = ?, assigned_reason = ?,
                is_deleted = ?, deleted_at = ?,
                provisioning_status = ?, provisioning_changed = ?, provisioning_reason = ?,
                starting_status = ?, starting_changed = ?, starting_reason = ?,
                deleting_status = ?, deleting_changed = ?, deleting_reason = ?,
                cleanup_status = ?, cleanup_changed = ?, cleanup_reason = ?,
                updated_at = ?, version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(&record.environment_id)
        .bind(&record.component_of)
        .bind(record.is_ready)
        .bind(record.is_assigned)
        .bind(record.assigned.map(|dt| dt.timestamp()))
        .bind(&record.assigned_reason)
        .bind(record.is_deleted)
        .bind(record.deleted.map(|dt| dt.timestamp()))
        .bind(record.provisioning.status)
        .bind(record.provisioning.changed.map(|dt| dt.timestamp()))
        .bind(&record.provisioning.reason)
        .bind(record.starting.status)
        .bind(record.starting.changed.map(|dt| dt.timestamp()))
        .bind(&record.starting.reason)
        .bind(record.deleting.status)
        .bind(record.deleting.changed.map(|dt| dt.timestamp()))
        .bind(&record.deleting.reason)
        .bind(record.cleanup.status)
        .bind(record.cleanup.changed.map(|dt| dt.timestamp()))
        .bind(&record.cleanup.reason)
        .bind(now)
        .bind(&record.id)
        .bind(record.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get(&record.id).await? {
                Some(_) => Err(BrokerError::Conflict(record.id.clone())),
                None => Err(BrokerError::NotFound(record.id.clone())),
            };
        }

        self.get(&record.id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(record.id.clone()))
    }

    #[instrument(skip(self))]
    async fn try_get(
        &self,
        pool_code: &str,
        environment_id: &str,
        reason: &str,
    ) -> Result<Option<ResourceRecord>> {
        let now = Utc::now().timestamp();

        // Single statement: the inner select and the guarded update run under
        // one write lock, so two callers can never claim the same row.
        let row = sqlx::query_as::<_, ResourceRow>(
            r#"
            UPDATE resources
            SET is_assigned = 1, assigned_at = ?, assigned_reason = ?, environment_id = ?,
                updated_at = ?, version = version + 1
            WHERE id = (
                SELECT id FROM resources
                WHERE pool_code = ? AND is_assigned = 0 AND is_deleted = 0 AND is_ready = 1
                ORDER BY created_at, id
                LIMIT 1
            )
            AND is_assigned = 0
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(reason)
        .bind(environment_id)
        .bind(now)
        .bind(pool_code)
        .fetch_optional(&self.pool)
        .await?;

        if row.is_none() {
            debug!(pool_code, "No pooled resource available");
        }

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn release_get(&self, id: &str) -> Result<()> {
        let now = Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE resources
            SET is_assigned = 0, assigned_at = NULL, assigned_reason = NULL, environment_id = NULL,
                updated_at = ?, version = version + 1
            WHERE id = ? AND is_deleted = 0
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(resource_id = id, "Release found no live record");
            return Err(BrokerError::NotFound(id.to_string()));
        }

        Ok(())
    }

    async fn pool_codes_for_unassigned(&self) -> Result<Vec<String>> {
        let codes = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT pool_code FROM resources
             WHERE is_assigned = 0 AND is_deleted = 0
             ORDER BY pool_code",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(codes)
    }

    async fn unassigned_in_pool(&self, pool_code: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM resources
             WHERE pool_code = ? AND is_assigned = 0 AND is_deleted = 0
             ORDER BY created_at, id",
        )
        .bind(pool_code)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn count_unassigned(&self, pool_code: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM resources
             WHERE pool_code = ? AND is_assigned = 0 AND is_deleted = 0",
        )
        .bind(pool_code)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

// Internal row type for sqlx
#[derive(sqlx::FromRow)]
struct ResourceRow {
    id: String,
    resource_type: ResourceType,
    sku_name: String,
    location: String,
    pool_code: String,
    pool_version_code: String,
    pool_dimensions: Option<String>,
    environment_id: Option<String>,
    component_of: Option<String>,
    is_ready: bool,
    is_assigned: bool,
    assigned_at: Option<i64>,
    assigned_reason: Option<String>,
    is_deleted: bool,
    deleted_at: Option<i64>,
    provisioning_status: Option<PhaseStatus>,
    provisioning_changed: Option<i64>,
    provisioning_reason: Option<String>,
    starting_status: Option<PhaseStatus>,
    starting_changed: Option<i64>,
    starting_reason: Option<String>,
    deleting_status: Option<PhaseStatus>,
    deleting_changed: Option<i64>,
    deleting_reason: Option<String>,
    cleanup_status: Option<PhaseStatus>,
    cleanup_changed: Option<i64>,
    cleanup_reason: Option<String>,
    created_at: i64,
    updated_at: i64,
    version: i64,
}

fn timestamp(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn phase(
    status: Option<PhaseStatus>,
    changed: Option<i64>,
    reason: Option<String>,
) -> PhaseState {
    PhaseState {
        status,
        changed: changed.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        reason,
    }
}

impl From<ResourceRow> for ResourceRecord {
    fn from(row: ResourceRow) -> Self {
        Self {
            id: row.id,
            resource_type: row.resource_type,
            sku_name: row.sku_name,
            location: row.location,
            pool_reference: PoolReference {
                code: row.pool_code,
                version_code: row.pool_version_code,
                dimensions: row
                    .pool_dimensions
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or_default(),
            },
            environment_id: row.environment_id,
            component_of: row.component_of,
            is_ready: row.is_ready,
            is_assigned: row.is_assigned,
            assigned: row.assigned_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            assigned_reason: row.assigned_reason,
            is_deleted: row.is_deleted,
            deleted: row.deleted_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            provisioning: phase(
                row.provisioning_status,
                row.provisioning_changed,
                row.provisioning_reason,
            ),
            starting: phase(row.starting_status, row.starting_changed, row.starting_reason),
            deleting: phase(row.deleting_status, row.deleting_changed, row.deleting_reason),
            cleanup: phase(row.cleanup_status, row.cleanup_changed, row.cleanup_reason),
            created: timestamp(row.created_at),
            updated: timestamp(row.updated_at),
            version: row.version,
        }
    }
}
