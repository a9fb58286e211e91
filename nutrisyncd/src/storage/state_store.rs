use std::fs;
use std::path::{Path, PathBuf};

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
}

/// One write in an atomic batch, see [`StateStore::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvChange<'a> {
    Set(&'a str, &'a str),
    Remove(&'a str),
}

/// Durable process-wide state: a small key-value table plus the pending
/// image set. Cloning shares the underlying pool.
#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open_default() -> Result<Self, StoreError> {
        Self::open(&default_db_path()?).await
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("value")?),
            None => None,
        })
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.apply(&[KvChange::Set(key, value)]).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.apply(&[KvChange::Remove(key)]).await
    }

    /// Applies all changes in a single transaction.
    pub async fn apply(&self, changes: &[KvChange<'_>]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for change in changes {
            match change {
                KvChange::Set(key, value) => {
                    sqlx::query(
                        "INSERT INTO kv (key, value) VALUES (?1, ?2)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    )
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await?;
                }
                KvChange::Remove(key) => {
                    sqlx::query("DELETE FROM kv WHERE key = ?1")
                        .bind(key)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Returns `true` when the path was not queued yet.
    pub async fn insert_pending(&self, path: &str, added_at: i64) -> Result<bool, StoreError> {
        let result =
            sqlx::query("INSERT OR IGNORE INTO pending_images (path, added_at) VALUES (?1, ?2)")
                .bind(path)
                .bind(added_at)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_pending(&self, path: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pending_images WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_pending(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT path FROM pending_images ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.try_get("path").map_err(StoreError::from))
            .collect()
    }

    pub async fn count_pending(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM pending_images")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }

    pub async fn clear_pending(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pending_images")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("nutrisync");
    path.push("state.db");
    Ok(path)
}
