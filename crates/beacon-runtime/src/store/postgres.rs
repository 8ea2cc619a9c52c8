use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};

use beacon_core::config::StoreConfig;
use beacon_core::error::{BeaconError, Result, StoreError, StoreResult};
use beacon_core::store::{parent_of, Change, Properties, Resource, ResourceStore};

/// Resource store backed by a single PostgreSQL table.
#[derive(Clone)]
pub struct PgResourceStore {
    pool: PgPool,
}

impl PgResourceStore {
    /// Create a store on an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using the store configuration.
    pub async fn from_config(config: &StoreConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.pool_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| BeaconError::Config(format!("Failed to connect to store: {}", e)))?;

        Ok(Self::new(pool))
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the resource table if it does not exist.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS beacon_resources (
                path TEXT PRIMARY KEY,
                parent TEXT NOT NULL,
                properties JSONB NOT NULL DEFAULT '{}'::jsonb,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_beacon_resources_parent ON beacon_resources (parent)",
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    async fn ensure_ancestors(tx: &mut Transaction<'_, Postgres>, path: &str) -> StoreResult<()> {
        let mut ancestors = Vec::new();
        let mut current = parent_of(path);
        while let Some(parent) = current {
            ancestors.push(parent);
            current = parent_of(parent);
        }

        for ancestor in ancestors.into_iter().rev() {
            sqlx::query(
                r#"
                INSERT INTO beacon_resources (path, parent, properties)
                VALUES ($1, $2, '{}'::jsonb)
                ON CONFLICT (path) DO NOTHING
                "#,
            )
            .bind(ancestor)
            .bind(parent_column(ancestor))
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        }
        Ok(())
    }

    async fn apply(tx: &mut Transaction<'_, Postgres>, change: Change) -> StoreResult<()> {
        match change {
            Change::Create { path, properties } => {
                Self::ensure_ancestors(tx, &path).await?;
                let result = sqlx::query(
                    r#"
                    INSERT INTO beacon_resources (path, parent, properties, updated_at)
                    VALUES ($1, $2, $3, NOW())
                    ON CONFLICT (path) DO NOTHING
                    "#,
                )
                .bind(&path)
                .bind(parent_column(&path))
                .bind(Value::Object(properties))
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx)?;

                if result.rows_affected() == 0 {
                    return Err(StoreError::conflict(path, "resource already exists"));
                }
            }
            Change::Put { path, properties } => {
                Self::ensure_ancestors(tx, &path).await?;
                sqlx::query(
                    r#"
                    INSERT INTO beacon_resources (path, parent, properties, updated_at)
                    VALUES ($1, $2, $3, NOW())
                    ON CONFLICT (path) DO UPDATE SET
                        properties = EXCLUDED.properties,
                        updated_at = NOW()
                    "#,
                )
                .bind(&path)
                .bind(parent_column(&path))
                .bind(Value::Object(properties))
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx)?;
            }
            Change::Delete { path } => {
                let result = sqlx::query("DELETE FROM beacon_resources WHERE path = $1")
                    .bind(&path)
                    .execute(&mut **tx)
                    .await
                    .map_err(map_sqlx)?;

                if result.rows_affected() == 0 {
                    return Err(StoreError::conflict(path, "resource does not exist"));
                }

                let below = format!("{}/", path);
                sqlx::query("DELETE FROM beacon_resources WHERE left(path, length($1)) = $1")
                    .bind(below)
                    .execute(&mut **tx)
                    .await
                    .map_err(map_sqlx)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for PgResourceStore {
    async fn get(&self, path: &str) -> StoreResult<Option<Resource>> {
        let row = sqlx::query("SELECT path, properties FROM beacon_resources WHERE path = $1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

        Ok(row.map(|row| {
            let properties: Value = row.get("properties");
            Resource::new(row.get::<String, _>("path"), into_properties(properties))
        }))
    }

    async fn list_children(&self, path: &str) -> StoreResult<Vec<Resource>> {
        let rows = sqlx::query(
            r#"
            SELECT path, properties
            FROM beacon_resources
            WHERE parent = $1
            ORDER BY path
            "#,
        )
        .bind(path.trim_end_matches('/'))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let properties: Value = row.get("properties");
                Resource::new(row.get::<String, _>("path"), into_properties(properties))
            })
            .collect())
    }

    async fn commit(&self, changes: Vec<Change>) -> StoreResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        for change in changes {
            // Dropping the transaction on error rolls it back.
            Self::apply(&mut tx, change).await?;
        }
        tx.commit().await.map_err(map_sqlx)
    }
}

/// Top-level resources are stored with an empty parent.
fn parent_column(path: &str) -> &str {
    parent_of(path).unwrap_or("")
}

fn into_properties(value: Value) -> Properties {
    match value {
        Value::Object(map) => map,
        _ => Properties::new(),
    }
}

fn map_sqlx(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(e.to_string())
        }
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            StoreError::conflict("", db.message().to_string())
        }
        other => StoreError::Backend(other.to_string()),
    }
}
