use anyhow::Context;
use chrono::Utc;
use directories::ProjectDirs;
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};

use super::{StorageBackend, StorageError};

/// SQLiteによるキー・バリューストレージ
pub struct SqliteStorage {
    connection: Mutex<rusqlite::Connection>,
    quota_bytes: Option<u64>,
    pub schema_version: u32,
}

impl SqliteStorage {
    /// 新しいデータベース接続を作成
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        let connection = rusqlite::Connection::open(db_path)?;
        Self::from_connection(connection)
    }

    /// インメモリデータベースを作成（テスト用）
    pub fn new_in_memory() -> Result<Self, StorageError> {
        let connection = rusqlite::Connection::open_in_memory()?;
        Self::from_connection(connection)
    }

    fn from_connection(connection: rusqlite::Connection) -> Result<Self, StorageError> {
        connection.execute_batch(include_str!("schema.sql"))?;
        tracing::info!("Database schema initialized successfully");

        Ok(Self {
            connection: Mutex::new(connection),
            quota_bytes: None,
            schema_version: 1,
        })
    }

    /// 値のバイト数合計に上限を設ける
    pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    /// 保存済みキーの一覧
    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        let connection = self.connection.lock();
        let mut stmt = connection.prepare("SELECT key FROM kv_store ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}

impl StorageBackend for SqliteStorage {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let connection = self.connection.lock();
        let raw: Option<String> = connection
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let raw = serde_json::to_string(&value)?;
        let updated_at = Utc::now().to_rfc3339();
        let connection = self.connection.lock();

        if let Some(limit) = self.quota_bytes {
            let others: i64 = connection.query_row(
                "SELECT COALESCE(SUM(LENGTH(CAST(value AS BLOB))), 0) FROM kv_store WHERE key != ?1",
                params![key],
                |row| row.get(0),
            )?;
            let needed = others.max(0) as u64 + raw.len() as u64;
            if needed > limit {
                tracing::warn!("💾 Quota exceeded writing {}: {} > {}", key, needed, limit);
                return Err(StorageError::QuotaExceeded { needed, limit });
            }
        }

        connection.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, raw, updated_at],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.connection
            .lock()
            .execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(())
    }
}

/// XDGデータディレクトリからデータベースパスを取得
pub fn get_database_path() -> anyhow::Result<PathBuf> {
    let project_dirs = ProjectDirs::from("dev", "tabchat", "tabchat")
        .ok_or_else(|| anyhow::anyhow!("Failed to get project directories"))?;

    let data_dir = project_dirs.data_dir();
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

    Ok(data_dir.join("tabchat.db"))
}
