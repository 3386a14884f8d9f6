use crate::error::AppError;
use crate::sync::types::{now_unix_ms, QueuedAction, Snapshot};
use crate::sync::{ACTION_QUEUE_KEY, SNAPSHOT_KEY};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;

const RECORD_FORMAT_VERSION: u32 = 1;

/// Durable key-value storage. No business logic lives behind this seam.
#[async_trait]
pub trait PersistentStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), AppError>;
    async fn delete(&self, key: &str) -> Result<(), AppError>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PersistentStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO kv_store (key, value, updated_at_ms) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at_ms=excluded.updated_at_ms",
        )
        .bind(key)
        .bind(value)
        .bind(now_unix_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AppError> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord<T> {
    version: u32,
    saved_at_ms: i64,
    data: T,
}

async fn load_record<T: DeserializeOwned>(
    store: &dyn PersistentStore,
    key: &str,
) -> Result<Option<T>, AppError> {
    let Some(raw) = store.get(key).await? else {
        return Ok(None);
    };

    let record: StoredRecord<T> = serde_json::from_str(&raw)?;
    if record.version != RECORD_FORMAT_VERSION {
        return Err(AppError::InvalidArgument(format!(
            "unsupported record version {} under '{key}'",
            record.version
        )));
    }
    Ok(Some(record.data))
}

async fn save_record<T: Serialize>(
    store: &dyn PersistentStore,
    key: &str,
    data: &T,
) -> Result<(), AppError> {
    let record = StoredRecord {
        version: RECORD_FORMAT_VERSION,
        saved_at_ms: now_unix_ms(),
        data,
    };
    let encoded = serde_json::to_string(&record)?;
    store.set(key, &encoded).await
}

pub async fn load_snapshot(store: &dyn PersistentStore) -> Result<Option<Snapshot>, AppError> {
    load_record(store, SNAPSHOT_KEY).await
}

pub async fn save_snapshot(store: &dyn PersistentStore, snapshot: &Snapshot) -> Result<(), AppError> {
    save_record(store, SNAPSHOT_KEY, snapshot).await
}

pub async fn reset_snapshot(store: &dyn PersistentStore) -> Result<(), AppError> {
    store.delete(SNAPSHOT_KEY).await
}

pub async fn load_queue(store: &dyn PersistentStore) -> Result<Vec<QueuedAction>, AppError> {
    Ok(load_record(store, ACTION_QUEUE_KEY).await?.unwrap_or_default())
}

pub async fn save_queue(store: &dyn PersistentStore, actions: &[QueuedAction]) -> Result<(), AppError> {
    save_record(store, ACTION_QUEUE_KEY, &actions).await
}
