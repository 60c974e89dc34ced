// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed key-value backend.

use std::path::Path;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use super::{KeyValueStore, VersionedValue};
use crate::error::{Error, Result};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// [`KeyValueStore`] over a single SQLite table.
///
/// Every write stores a fresh UUID version; conditional writes are single
/// `INSERT ... ON CONFLICT DO NOTHING` / `UPDATE ... WHERE version = ?`
/// statements, so SQLite's own write serialization makes them atomic.
#[derive(Clone)]
pub struct SqliteKeyValueStore {
    pool: SqlitePool,
}

impl SqliteKeyValueStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Other(format!("Failed to create directory {:?}: {}", parent, e))
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Open a private in-memory database and run migrations.
    pub async fn in_memory() -> Result<Self> {
        // A single connection: every connection to `:memory:` is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT value, version
            FROM kv_entries
            WHERE key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(value, version)| VersionedValue { value, version }))
    }

    async fn get_with_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT key, value, version
            FROM kv_entries
            WHERE substr(key, 1, ?) = ?
            ORDER BY key
            "#,
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(key, value, version)| (key, VersionedValue { value, version }))
            .collect())
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected_version: Option<&str>,
        value: &str,
    ) -> Result<bool> {
        let version = Uuid::new_v4().to_string();

        let result = match expected_version {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO kv_entries (key, value, version, updated_at)
                    VALUES (?, ?, ?, CURRENT_TIMESTAMP)
                    ON CONFLICT(key) DO NOTHING
                    "#,
                )
                .bind(key)
                .bind(value)
                .bind(&version)
                .execute(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE kv_entries
                    SET value = ?, version = ?, updated_at = CURRENT_TIMESTAMP
                    WHERE key = ? AND version = ?
                    "#,
                )
                .bind(value)
                .bind(&version)
                .bind(key)
                .bind(expected)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
