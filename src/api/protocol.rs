//! バックエンドコーディネーターとのメッセージ形式
//!
//! リクエストは必須の `action` と任意のフィールドをフラットに持つJSONオブジェクト。
//! ストリーミング応答は `StreamEvent` としてプッシュチャネルから届く。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::transport::TransportError;

/// コーディネーターが受け付けるアクション名
pub mod actions {
    /// チャット応答のストリーミング開始
    pub const SEND_CHAT_MESSAGE: &str = "sendChatMessage";
    /// 進行中ストリームのキャンセル
    pub const CANCEL_STREAM: &str = "cancelStream";
}

/// ストリームID
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display, Serialize, Deserialize)]
pub struct StreamId(pub String);

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Transportリクエスト
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportRequest {
    pub action: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TransportRequest {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            fields: Map::new(),
        }
    }

    /// フィールドを追加（シリアライズできない値は黙って捨てない）
    pub fn with_field(
        mut self,
        key: impl Into<String>,
        value: impl Serialize,
    ) -> Result<Self, TransportError> {
        let value = serde_json::to_value(value)?;
        self.fields.insert(key.into(), value);
        Ok(self)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// `action` が空でないことを検証
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.action.trim().is_empty() {
            return Err(TransportError::MissingAction);
        }
        Ok(())
    }
}

/// Transportレスポンス
///
/// コンテキスト無効化時は `Value::Null` を持つ空レスポンスになる。
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransportResponse(pub Value);

impl TransportResponse {
    pub fn empty() -> Self {
        Self(Value::Null)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_null()
    }

    pub fn is_success(&self) -> bool {
        self.0
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.0.get("error").and_then(Value::as_str)
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.0
            .get("streamId")
            .and_then(Value::as_str)
            .map(StreamId::from)
    }
}

/// 会話履歴の1エントリ（バックエンドに送る形）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

/// ストリームチャンクの中身
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_chunk: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ChunkData {
    pub fn text(chunk: impl Into<String>) -> Self {
        Self {
            chunk: Some(chunk.into()),
            ..Default::default()
        }
    }

    pub fn thinking(chunk: impl Into<String>) -> Self {
        Self {
            thinking_chunk: Some(chunk.into()),
            ..Default::default()
        }
    }

    pub fn done(full_content: Option<String>, model: Option<String>) -> Self {
        Self {
            done: true,
            full_content,
            model,
            ..Default::default()
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// 終端チャンクかどうか（エラー > キャンセル > 完了の優先順）
    pub fn is_terminal(&self) -> bool {
        self.error.is_some() || self.cancelled || self.done
    }
}

/// プッシュチャネルで届くストリームイベント
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub stream_id: StreamId,
    pub chunk_data: ChunkData,
}

impl StreamEvent {
    pub fn new(stream_id: StreamId, chunk_data: ChunkData) -> Self {
        Self {
            stream_id,
            chunk_data,
        }
    }
}
