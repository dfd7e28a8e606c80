//! チャット状態変更のブロードキャスト
//!
//! UIはこのイベントを購読して再描画する。ストリーミング中の更新は
//! フラッシュ単位（1ティック最大1回）でしか流れない。

use tokio::sync::broadcast;

use crate::ledger::{ContextStatus, TokenStatistics, TurnOutcome};

/// 1ターン終了時のレポート
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub message_id: String,
    pub outcome: TurnOutcome,
    /// 確定した表示テキスト
    pub content: String,
    pub output_tokens: u64,
    pub api_cost: Option<f64>,
    /// 台帳を更新した場合の新しい統計
    pub statistics: Option<TokenStatistics>,
}

/// 状態変更イベント
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// メッセージが追加された
    MessageAppended { message_id: String, count: usize },

    /// ストリーミング中のメッセージが更新された
    StreamUpdated {
        message_id: String,
        content: String,
        thinking: String,
    },

    /// ターンが終了した
    TurnFinished(TurnReport),

    /// トークン統計が更新された
    StatisticsUpdated(TokenStatistics),

    /// コンテキストウィンドウ超過の恐れ
    ContextWarning(ContextStatus),

    /// 保存に失敗し、最後に保存された状態へ戻した
    PersistenceFailed { reason: String },

    /// 会話がクリアされた
    SessionCleared { session_id: String },

    /// 会話が読み込まれた
    SessionLoaded { session_id: String, count: usize },
}

/// チャットイベントのブロードキャスター
///
/// サービスインスタンスごとに1つ持つ。
#[derive(Debug, Clone)]
pub struct ChatBroadcaster {
    sender: broadcast::Sender<ChatEvent>,
}

impl ChatBroadcaster {
    /// バッファサイズは256。遅い購読者は古いイベントを取りこぼす（lagged）。
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.sender.subscribe()
    }

    /// 購読者がいない場合は破棄される
    pub fn broadcast(&self, event: ChatEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChatBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_subscribers_receive_same_event() {
        let broadcaster = ChatBroadcaster::new();
        let mut rx1 = broadcaster.subscribe();
        let mut rx2 = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        broadcaster.broadcast(ChatEvent::SessionCleared {
            session_id: "tab-1".to_string(),
        });

        for rx in [&mut rx1, &mut rx2] {
            let received = tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .expect("timeout")
                .expect("receive error");
            assert!(matches!(received, ChatEvent::SessionCleared { .. }));
        }
    }

    #[test]
    fn test_broadcast_without_subscribers_is_noop() {
        let broadcaster = ChatBroadcaster::new();
        broadcaster.broadcast(ChatEvent::PersistenceFailed {
            reason: "quota".to_string(),
        });
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
