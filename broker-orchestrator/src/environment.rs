use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
pub enum EnvironmentState {
    Queued,
    Provisioning,
    Available,
    Starting,
    ShuttingDown,
    Shutdown,
    Exporting,
    Updating,
    Failed,
    Deleted,
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum EnvironmentKind {
    #[default]
    Regular,
    /// Long-lived; its compute is never swapped out underneath it.
    Static,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub id: String,
    pub name: String,
    pub kind: EnvironmentKind,
    pub state: EnvironmentState,
    pub compute_resource_id: Option<String>,
    /// Deadline for the current state, if one applies.
    pub state_timeout: Option<DateTime<Utc>>,
    pub state_updated: DateTime<Utc>,
    pub last_state_reason: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl EnvironmentRecord {
    pub fn new(name: impl Into<String>, state: EnvironmentState) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            kind: EnvironmentKind::Regular,
            state,
            compute_resource_id: None,
            state_timeout: None,
            state_updated: now,
            last_state_reason: None,
            created: now,
            updated: now,
        }
    }
}

#[async_trait]
pub trait EnvironmentRepository: Send + Sync {
    async fn create(&self, record: &EnvironmentRecord) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<EnvironmentRecord>>;

    async fn set_state(&self, id: &str, state: EnvironmentState, reason: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteEnvironmentRepository {
    pool: SqlitePool,
}

impl SqliteEnvironmentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn shared(pool: SqlitePool) -> Arc<dyn EnvironmentRepository> {
        Arc::new(Self::new(pool))
    }
}

#[async_trait]
impl EnvironmentRepository for SqliteEnvironmentRepository {
    #[instrument(skip(self, record), fields(environment_id = %record.id))]
    async fn create(&self, record: &EnvironmentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO environments (
                id, name, kind, state, compute_resource_id, state_timeout, state_updated,
                last_state_reason, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(record.kind)
        .bind(record.state)
        .bind(&record.compute_resource_id)
        .bind(record.state_timeout.map(|dt| dt.timestamp()))
        .bind(record.state_updated.timestamp())
        .bind(&record.last_state_reason)
        .bind(record.created.timestamp())
        .bind(record.updated.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<EnvironmentRecord>> {
        let row = sqlx::query_as::<_, EnvironmentRow>("SELECT * FROM environments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn set_state(&self, id: &str, state: EnvironmentState, reason: &str) -> Result<()> {
        let now = Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE environments
            SET state = ?, last_state_reason = ?, state_updated = ?, state_timeout = NULL,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(state)
        .bind(reason)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::NotFound(id.to_string()));
        }

        info!(environment_id = id, %state, reason, "Environment state changed");
        Ok(())
    }
}

// Internal row type for sqlx
#[derive(sqlx::FromRow)]
struct EnvironmentRow {
    id: String,
    name: String,
    kind: EnvironmentKind,
    state: EnvironmentState,
    compute_resource_id: Option<String>,
    state_timeout: Option<i64>,
    state_updated: i64,
    last_state_reason: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl From<EnvironmentRow> for EnvironmentRecord {
    fn from(row: EnvironmentRow) -> Self {
        let ts = |secs: i64| DateTime::from_timestamp(secs, 0).unwrap_or_default();
        Self {
            id: row.id,
            name: row.name,
            kind: row.kind,
            state: row.state,
            compute_resource_id: row.compute_resource_id,
            state_timeout: row.state_timeout.and_then(|t| DateTime::from_timestamp(t, 0)),
            state_updated: ts(row.state_updated),
            last_state_reason: row.last_state_reason,
            created: ts(row.created_at),
            updated: ts(row.updated_at),
        }
    }
}
