//! チャットのデータモデル
//!
//! メッセージはロールごとのバリアントで表し、各ロールに関係するフィールドだけを持つ。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::HistoryEntry;

/// メッセージのロール
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

/// ユーザーメッセージ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
}

/// アシスタントメッセージ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_content: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    /// このターンの料金（料金表が無い場合はNone）
    #[serde(default)]
    pub api_cost: Option<f64>,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

/// システムメッセージ（エラー通知など）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMessage {
    pub id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// チャットメッセージ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    User(UserMessage),
    Assistant(AssistantMessage),
    System(SystemMessage),
}

impl ChatMessage {
    pub fn user(content: impl Into<String>, input_tokens: Option<u64>) -> Self {
        Self::User(UserMessage {
            id: new_message_id(),
            content: content.into(),
            timestamp: Utc::now(),
            input_tokens,
        })
    }

    /// ストリーミング中のアシスタント用プレースホルダー
    pub fn streaming_placeholder(platform_id: Option<String>, model_id: Option<String>) -> Self {
        Self::Assistant(AssistantMessage {
            id: new_message_id(),
            content: String::new(),
            thinking_content: None,
            timestamp: Utc::now(),
            output_tokens: None,
            api_cost: None,
            is_streaming: true,
            platform_id,
            model_id,
        })
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::System(SystemMessage {
            id: new_message_id(),
            content: content.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn id(&self) -> &str {
        match self {
            ChatMessage::User(m) => &m.id,
            ChatMessage::Assistant(m) => &m.id,
            ChatMessage::System(m) => &m.id,
        }
    }

    pub fn role(&self) -> MessageRole {
        match self {
            ChatMessage::User(_) => MessageRole::User,
            ChatMessage::Assistant(_) => MessageRole::Assistant,
            ChatMessage::System(_) => MessageRole::System,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            ChatMessage::User(m) => &m.content,
            ChatMessage::Assistant(m) => &m.content,
            ChatMessage::System(m) => &m.content,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ChatMessage::User(m) => m.timestamp,
            ChatMessage::Assistant(m) => m.timestamp,
            ChatMessage::System(m) => m.timestamp,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, ChatMessage::Assistant(m) if m.is_streaming)
    }

    pub fn as_user(&self) -> Option<&UserMessage> {
        match self {
            ChatMessage::User(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            ChatMessage::Assistant(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_assistant_mut(&mut self) -> Option<&mut AssistantMessage> {
        match self {
            ChatMessage::Assistant(m) => Some(m),
            _ => None,
        }
    }

    /// 会話履歴として送る形に変換（システムメッセージは送らない）
    pub fn to_history_entry(&self) -> Option<HistoryEntry> {
        match self {
            ChatMessage::System(_) => None,
            other => Some(HistoryEntry {
                role: other.role().as_str().to_string(),
                content: other.content().to_string(),
            }),
        }
    }
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// セッションのメタデータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub id: String,
    pub platform_id: Option<String>,
    pub model_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// 1会話分のセッション
///
/// メッセージの並びがそのまま会話順。ストリーミング中のメッセージは常に高々1件。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub metadata: SessionMetadata,
    pub messages: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn new(
        id: impl Into<String>,
        platform_id: Option<String>,
        model_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            metadata: SessionMetadata {
                id: id.into(),
                platform_id,
                model_id,
                created_at: now,
                last_activity_at: now,
            },
            messages: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn position(&self, message_id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id() == message_id)
    }

    pub fn find(&self, message_id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id() == message_id)
    }

    pub fn find_mut(&mut self, message_id: &str) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|m| m.id() == message_id)
    }

    pub fn streaming_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_streaming()).count()
    }

    pub fn touch(&mut self) {
        self.metadata.last_activity_at = Utc::now();
    }

    /// 指定範囲のメッセージから会話履歴を作成
    pub fn history(&self, end: usize) -> Vec<HistoryEntry> {
        self.messages[..end.min(self.messages.len())]
            .iter()
            .filter_map(ChatMessage::to_history_entry)
            .collect()
    }
}
