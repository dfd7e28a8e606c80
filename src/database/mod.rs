//! 永続化レイヤー
//!
//! キー → JSON の単純なストアを `StorageBackend` として抽象化し、
//! セッションストアとトークン台帳はこれを注入して使う。

pub mod memory;
pub mod session_store;
pub mod sqlite;

pub use memory::MemoryStorage;
pub use session_store::ChatSessionStore;
pub use sqlite::{get_database_path, SqliteStorage};

use crate::config::StorageConfig;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// セッションレコードのキー接頭辞
pub const SESSION_KEY_PREFIX: &str = "chat_session:";
/// セッションID一覧のキー
pub const SESSION_INDEX_KEY: &str = "chat_session_index";
/// トークン統計（全セッション分のマップ）のキー
pub const TOKEN_STATISTICS_KEY: &str = "token_statistics";

pub fn session_key(session_id: &str) -> String {
    format!("{}{}", SESSION_KEY_PREFIX, session_id)
}

/// 永続化エラー
#[derive(Error, Debug)]
pub enum StorageError {
    /// 容量上限超過
    #[error("Storage quota exceeded: {needed} bytes needed, limit is {limit} bytes")]
    QuotaExceeded { needed: u64, limit: u64 },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend error: {message}")]
    Backend { message: String },
}

impl StorageError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// キー → JSON ストア
///
/// 1キーの値は常に丸ごと読み書きする（部分更新なし）。
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    fn set(&self, key: &str, value: Value) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// 設定からバックエンドを開く
///
/// `in_memory` ならプロセス内のマップ、それ以外はSQLiteファイル
/// （`database_path` 未指定時はXDGデータディレクトリ）。
pub fn open_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>, StorageError> {
    if config.in_memory {
        let storage = match config.quota_bytes {
            Some(limit) => MemoryStorage::with_quota(limit),
            None => MemoryStorage::new(),
        };
        tracing::info!("💾 Using in-memory storage");
        return Ok(Arc::new(storage));
    }

    let path = match &config.database_path {
        Some(path) => path.clone(),
        None => get_database_path().map_err(|e| StorageError::backend(format!("{:#}", e)))?,
    };
    tracing::info!("💾 Opening SQLite storage at {}", path.display());

    let storage = SqliteStorage::new(&path)?.with_quota(config.quota_bytes);
    Ok(Arc::new(storage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_open_in_memory_applies_quota() {
        let storage = open_storage(&StorageConfig {
            in_memory: true,
            quota_bytes: Some(4),
            ..Default::default()
        })
        .unwrap();

        assert!(matches!(
            storage.set("k", json!("too long")),
            Err(StorageError::QuotaExceeded { .. })
        ));
    }

    #[test]
    fn test_open_sqlite_at_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tabchat.db");
        let config = StorageConfig {
            database_path: Some(path.clone()),
            ..Default::default()
        };

        open_storage(&config).unwrap().set("k", json!(1)).unwrap();

        assert!(path.exists());
        assert_eq!(open_storage(&config).unwrap().get("k").unwrap(), Some(json!(1)));
    }

    #[test]
    fn test_session_key_prefix() {
        assert_eq!(session_key("tab-1"), "chat_session:tab-1");
    }
}
