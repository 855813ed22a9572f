//! [`LeaseStore`] over the broker's sqlite database, so every worker sharing
//! the database file agrees on lease ownership.

use async_trait::async_trait;
use broker_lease::{BlobKey, LeaseError, LeaseStore, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct SqliteLeaseStore {
    pool: SqlitePool,
}

impl SqliteLeaseStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn blob_exists(&self, key: &BlobKey) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM lease_blobs WHERE container = ? AND name = ?",
        )
        .bind(&key.container)
        .bind(&key.name)
        .fetch_one(&self.pool)
        .await
        .map_err(LeaseError::store)?;
        Ok(count > 0)
    }

    /// Maps an update that matched nothing to the reason it matched nothing.
    async fn missing_or(&self, key: &BlobKey, err: LeaseError) -> LeaseError {
        match self.blob_exists(key).await {
            Ok(true) => err,
            Ok(false) => LeaseError::BlobNotFound(key.to_string()),
            Err(e) => e,
        }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn create_container_if_absent(&self, container: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO lease_containers (name) VALUES (?)")
            .bind(container)
            .execute(&self.pool)
            .await
            .map_err(LeaseError::store)?;
        Ok(())
    }

    #[instrument(skip(self, body))]
    async fn create_blob_if_absent(&self, key: &BlobKey, body: &str) -> Result<()> {
        let containers = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM lease_containers WHERE name = ?",
        )
        .bind(&key.container)
        .fetch_one(&self.pool)
        .await
        .map_err(LeaseError::store)?;
        if containers == 0 {
            return Err(LeaseError::BlobNotFound(format!(
                "container {} does not exist",
                key.container
            )));
        }

        let result = sqlx::query(
            "INSERT OR IGNORE INTO lease_blobs (container, name, body, last_modified)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&key.container)
        .bind(&key.name)
        .bind(body)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(LeaseError::store)?;

        if result.rows_affected() > 0 {
            debug!(lease = %key, "Created lease blob");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn acquire(&self, key: &BlobKey, duration: Duration) -> Result<String> {
        let now = now_millis();
        let duration_ms = duration.as_millis() as i64;
        let lease_id = Uuid::new_v4().to_string();

        let result = sqlx::query(
            r#"
            UPDATE lease_blobs
            SET lease_id = ?, lease_expires = ?, lease_duration_ms = ?
            WHERE container = ? AND name = ?
              AND (lease_id IS NULL OR lease_expires IS NULL OR lease_expires <= ?)
            "#,
        )
        .bind(&lease_id)
        .bind(now + duration_ms)
        .bind(duration_ms)
        .bind(&key.container)
        .bind(&key.name)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(LeaseError::store)?;

        if result.rows_affected() == 0 {
            return Err(self
                .missing_or(key, LeaseError::AlreadyPresent(key.to_string()))
                .await);
        }
        Ok(lease_id)
    }

    async fn renew(&self, key: &BlobKey, lease_id: &str) -> Result<()> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            UPDATE lease_blobs
            SET lease_expires = ? + lease_duration_ms
            WHERE container = ? AND name = ? AND lease_id = ? AND lease_expires > ?
            "#,
        )
        .bind(now)
        .bind(&key.container)
        .bind(&key.name)
        .bind(lease_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(LeaseError::store)?;

        if result.rows_affected() == 0 {
            return Err(self.missing_or(key, LeaseError::LeaseLost(key.to_string())).await);
        }
        Ok(())
    }

    async fn release(&self, key: &BlobKey, lease_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE lease_blobs
            SET lease_id = NULL, lease_expires = NULL, lease_duration_ms = NULL
            WHERE container = ? AND name = ? AND lease_id = ?
            "#,
        )
        .bind(&key.container)
        .bind(&key.name)
        .bind(lease_id)
        .execute(&self.pool)
        .await
        .map_err(LeaseError::store)?;

        if result.rows_affected() == 0 {
            return Err(self.missing_or(key, LeaseError::LeaseLost(key.to_string())).await);
        }
        Ok(())
    }

    async fn last_modified(&self, key: &BlobKey) -> Result<Option<DateTime<Utc>>> {
        let modified = sqlx::query_scalar::<_, i64>(
            "SELECT last_modified FROM lease_blobs WHERE container = ? AND name = ?",
        )
        .bind(&key.container)
        .bind(&key.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(LeaseError::store)?;

        Ok(modified.and_then(DateTime::from_timestamp_millis))
    }

    async fn touch(&self, key: &BlobKey, lease_id: &str, body: &str) -> Result<()> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            UPDATE lease_blobs
            SET body = ?, last_modified = ?
            WHERE container = ? AND name = ? AND lease_id = ? AND lease_expires > ?
            "#,
        )
        .bind(body)
        .bind(now)
        .bind(&key.container)
        .bind(&key.name)
        .bind(lease_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(LeaseError::store)?;

        if result.rows_affected() == 0 {
            return Err(self.missing_or(key, LeaseError::LeaseLost(key.to_string())).await);
        }
        Ok(())
    }
}
