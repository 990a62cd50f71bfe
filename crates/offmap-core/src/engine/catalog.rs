//! SQLite-based region catalog
//!
//! Stores region definitions and their last persisted status so regions
//! survive restarts of the storage engine.

use crate::error::OffmapError;
use chrono::{DateTime, Utc};
use offmap_types::{OfflineRegion, RegionDownloadState, RegionStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;
use uuid::Uuid;

/// Database connection pool for the region catalog
#[derive(Clone, Debug)]
pub struct RegionCatalog {
    pool: SqlitePool,
}

impl RegionCatalog {
    /// Open (or create) the catalog database
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, OffmapError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS regions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                definition TEXT NOT NULL,
                metadata BLOB NOT NULL,
                created_at TEXT NOT NULL,
                completed_resource_count INTEGER NOT NULL DEFAULT 0,
                completed_resource_size INTEGER NOT NULL DEFAULT 0,
                completed_tile_count INTEGER NOT NULL DEFAULT 0,
                completed_tile_size INTEGER NOT NULL DEFAULT 0,
                required_resource_count INTEGER NOT NULL DEFAULT 0,
                required_resource_count_is_precise INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_regions_created ON regions(created_at);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Add a newly created region
    pub async fn insert_region(&self, region: &OfflineRegion) -> Result<(), OffmapError> {
        let definition = serde_json::to_string(&region.definition)?;

        sqlx::query(
            r#"
            INSERT INTO regions (id, name, definition, metadata, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(region.id.to_string())
        .bind(&region.name)
        .bind(definition)
        .bind(&region.metadata)
        .bind(region.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load a region and its last persisted status
    pub async fn load_region(
        &self,
        id: Uuid,
    ) -> Result<Option<(OfflineRegion, RegionStatus)>, OffmapError> {
        let row = sqlx::query("SELECT * FROM regions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_region).transpose()
    }

    /// Load every region, oldest first
    pub async fn load_all_regions(&self) -> Result<Vec<(OfflineRegion, RegionStatus)>, OffmapError> {
        let rows = sqlx::query("SELECT * FROM regions ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_region).collect()
    }

    /// Persist the latest status of a region
    pub async fn update_status(&self, id: Uuid, status: &RegionStatus) -> Result<(), OffmapError> {
        sqlx::query(
            r#"
            UPDATE regions
            SET completed_resource_count = ?,
                completed_resource_size = ?,
                completed_tile_count = ?,
                completed_tile_size = ?,
                required_resource_count = ?,
                required_resource_count_is_precise = ?
            WHERE id = ?
            "#,
        )
        .bind(status.completed_resource_count as i64)
        .bind(status.completed_resource_size as i64)
        .bind(status.completed_tile_count as i64)
        .bind(status.completed_tile_size as i64)
        .bind(status.required_resource_count as i64)
        .bind(if status.required_resource_count_is_precise { 1i64 } else { 0i64 })
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete a region, returning whether it existed
    pub async fn delete_region(&self, id: Uuid) -> Result<bool, OffmapError> {
        let result = sqlx::query("DELETE FROM regions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Convert a database row to a region and its status
fn row_to_region(row: SqliteRow) -> Result<(OfflineRegion, RegionStatus), OffmapError> {
    let definition = serde_json::from_str(row.get::<String, _>("definition").as_str())?;

    let region = OfflineRegion {
        id: Uuid::parse_str(row.get::<String, _>("id").as_str())
            .map_err(|e| OffmapError::Serialization(e.to_string()))?,
        name: row.get("name"),
        definition,
        metadata: row.get("metadata"),
        created_at: DateTime::parse_from_rfc3339(row.get::<String, _>("created_at").as_str())
            .map_err(|e| OffmapError::Serialization(e.to_string()))?
            .with_timezone(&Utc),
    };

    // Nothing is downloading right after a load
    let status = RegionStatus {
        download_state: RegionDownloadState::Inactive,
        completed_resource_count: row.get::<i64, _>("completed_resource_count") as u64,
        completed_resource_size: row.get::<i64, _>("completed_resource_size") as u64,
        completed_tile_count: row.get::<i64, _>("completed_tile_count") as u64,
        completed_tile_size: row.get::<i64, _>("completed_tile_size") as u64,
        required_resource_count: row.get::<i64, _>("required_resource_count") as u64,
        required_resource_count_is_precise: row.get::<i64, _>("required_resource_count_is_precise") != 0,
    };

    Ok((region, status))
}
