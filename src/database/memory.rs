use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

use super::{StorageBackend, StorageError};

/// インメモリストレージ（テスト・一時セッション用）
///
/// `quota_bytes` を設定すると、全値のJSONサイズ合計が上限を超える書き込みを拒否する。
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Value>>,
    quota_bytes: RwLock<Option<u64>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            quota_bytes: RwLock::new(Some(quota_bytes)),
        }
    }

    /// 容量上限を変更（Noneで無制限）
    pub fn set_quota(&self, quota_bytes: Option<u64>) {
        *self.quota_bytes.write() = quota_bytes;
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn used_bytes(&self) -> u64 {
        self.entries
            .read()
            .values()
            .map(|v| v.to_string().len() as u64)
            .sum()
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let mut entries = self.entries.write();

        if let Some(limit) = *self.quota_bytes.read() {
            let others: u64 = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.to_string().len() as u64)
                .sum();
            let needed = others + value.to_string().len() as u64;
            if needed > limit {
                return Err(StorageError::QuotaExceeded { needed, limit });
            }
        }

        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_remove() {
        let storage = MemoryStorage::new();
        storage.set("a", json!({"x": 1})).unwrap();

        assert_eq!(storage.get("a").unwrap(), Some(json!({"x": 1})));
        assert_eq!(storage.keys(), vec!["a".to_string()]);

        storage.remove("a").unwrap();
        assert_eq!(storage.get("a").unwrap(), None);
    }

    #[test]
    fn test_quota_rejects_oversized_write_and_keeps_old_value() {
        let storage = MemoryStorage::with_quota(20);
        storage.set("k", json!("short")).unwrap();

        let err = storage
            .set("k", json!("this value is far too long"))
            .unwrap_err();

        assert!(matches!(err, StorageError::QuotaExceeded { limit: 20, .. }));
        assert_eq!(storage.get("k").unwrap(), Some(json!("short")));
    }

    #[test]
    fn test_overwrite_does_not_double_count() {
        let storage = MemoryStorage::with_quota(12);
        storage.set("k", json!("12345678")).unwrap();
        // 同じキーの上書きは旧値を除いて計算する
        storage.set("k", json!("87654321")).unwrap();
        assert_eq!(storage.used_bytes(), 10);
    }
}
