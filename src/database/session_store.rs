//! チャットセッションの永続化
//!
//! セッションはレコード単位で丸ごと読み書きする（後勝ち）。

use std::sync::Arc;

use super::{session_key, StorageBackend, StorageError, SESSION_INDEX_KEY};
use crate::chat::models::ChatSession;

/// セッションストア
#[derive(Clone)]
pub struct ChatSessionStore {
    storage: Arc<dyn StorageBackend>,
}

impl ChatSessionStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// セッションを読み込む
    ///
    /// 前回のコンテキストがストリーミング途中で消えた場合に備え、
    /// `isStreaming` のまま残ったメッセージは非ストリーミングに戻す。
    pub fn load(&self, session_id: &str) -> Result<Option<ChatSession>, StorageError> {
        let Some(value) = self.storage.get(&session_key(session_id))? else {
            return Ok(None);
        };

        let mut session: ChatSession = serde_json::from_value(value)?;
        let mut normalized = 0;
        for message in session.messages.iter_mut() {
            if let Some(assistant) = message.as_assistant_mut() {
                if assistant.is_streaming {
                    assistant.is_streaming = false;
                    normalized += 1;
                }
            }
        }
        if normalized > 0 {
            tracing::warn!(
                session_id,
                normalized,
                "Loaded session had stale streaming messages"
            );
        }

        tracing::debug!(
            session_id,
            messages = session.messages.len(),
            "📂 Session loaded"
        );
        Ok(Some(session))
    }

    /// セッションを保存（最終アクティビティ時刻を更新）
    pub fn save(&self, session: &mut ChatSession) -> Result<(), StorageError> {
        session.touch();
        let value = serde_json::to_value(&*session)?;
        self.storage.set(&session_key(session.id()), value)?;
        self.add_to_index(session.id())?;

        tracing::debug!(
            session_id = session.id(),
            messages = session.messages.len(),
            "💾 Session saved"
        );
        Ok(())
    }

    pub fn delete(&self, session_id: &str) -> Result<(), StorageError> {
        self.storage.remove(&session_key(session_id))?;

        let mut ids = self.list_session_ids()?;
        let before = ids.len();
        ids.retain(|id| id != session_id);
        if ids.len() != before {
            self.storage
                .set(SESSION_INDEX_KEY, serde_json::to_value(&ids)?)?;
        }

        tracing::info!(session_id, "🗑️ Session deleted");
        Ok(())
    }

    pub fn list_session_ids(&self) -> Result<Vec<String>, StorageError> {
        match self.storage.get(SESSION_INDEX_KEY)? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    fn add_to_index(&self, session_id: &str) -> Result<(), StorageError> {
        let mut ids = self.list_session_ids()?;
        if ids.iter().any(|id| id == session_id) {
            return Ok(());
        }
        ids.push(session_id.to_string());
        self.storage
            .set(SESSION_INDEX_KEY, serde_json::to_value(&ids)?)
    }
}
