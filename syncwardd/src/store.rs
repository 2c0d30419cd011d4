use std::{fs, path::Path, path::PathBuf};

use rand::Rng;
use rand::distributions::Alphanumeric;
use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;
use time::OffsetDateTime;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const LAST_EVENT_ID_KEY: &str = "last_event_id";
const API_KEY_KEY: &str = "api_key";
const API_KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Small key/value state that has to survive daemon restarts: the event
/// cursor and the generated control-plane API key.
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

    pub async fn new_default() -> Result<Self, StoreError> {
        Self::open(&default_db_path()?).await
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM kv_state WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    pub async fn set_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv_state (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at;
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(OffsetDateTime::now_utc().unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn last_event_id(&self) -> Result<u64, StoreError> {
        match self.get_value(LAST_EVENT_ID_KEY).await? {
            Some(value) => value.parse::<u64>().map_err(|_| StoreError::InvalidValue {
                key: LAST_EVENT_ID_KEY.to_string(),
                value,
            }),
            None => Ok(0),
        }
    }

    pub async fn set_last_event_id(&self, id: u64) -> Result<(), StoreError> {
        self.set_value(LAST_EVENT_ID_KEY, &id.to_string()).await
    }

    /// Returns the persisted API key, generating and storing one on first use.
    pub async fn ensure_api_key(&self) -> Result<String, StoreError> {
        if let Some(key) = self.get_value(API_KEY_KEY).await?
            && !key.is_empty()
        {
            return Ok(key);
        }
        let key: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(API_KEY_LEN)
            .map(char::from)
            .collect();
        self.set_value(API_KEY_KEY, &key).await?;
        Ok(key)
    }
}

fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("syncward");
    path.push("state.db");
    Ok(path)
}

#[cfg(test)]
pub(crate) async fn memory_store() -> StateStore {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = StateStore::from_pool(pool);
    store.init().await.unwrap();
    store
}
