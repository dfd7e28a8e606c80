//! インプロセスのバックエンドコーディネーター
//!
//! ベンダーAPIを呼ばずに、あらかじめ用意したチャンク列をプッシュチャネルへ流す。
//! 組み込み先のテストや開発時のオフライン動作で使う。`testing` フィーチャーで有効になる。

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use super::protocol::{actions, ChunkData, StreamEvent, StreamId, TransportRequest};
use super::transport::{ChannelError, MessageChannel};

/// 1回の `sendChatMessage` に対する応答スクリプト
#[derive(Debug, Clone, Default)]
pub struct StreamScript {
    /// 受理直後にプッシュするチャンク
    pub chunks: Vec<ChunkData>,
}

impl StreamScript {
    pub fn new(chunks: Vec<ChunkData>) -> Self {
        Self { chunks }
    }

    /// テキストを分割して流し、`fullContent` 付きで完了する
    pub fn completing(fragments: &[&str], model: Option<&str>) -> Self {
        let mut chunks: Vec<ChunkData> = fragments.iter().map(|f| ChunkData::text(*f)).collect();
        chunks.push(ChunkData::done(
            Some(fragments.concat()),
            model.map(str::to_string),
        ));
        Self { chunks }
    }

    /// 終端チャンクを送らず、キャンセル待ちのまま開いておく
    pub fn open(fragments: &[&str]) -> Self {
        Self {
            chunks: fragments.iter().map(|f| ChunkData::text(*f)).collect(),
        }
    }

    pub fn failing(error: impl Into<String>) -> Self {
        Self {
            chunks: vec![ChunkData::failed(error)],
        }
    }
}

/// スクリプト駆動のコーディネーター
#[derive(Debug)]
pub struct ScriptedCoordinator {
    sender: mpsc::UnboundedSender<StreamEvent>,
    scripts: Mutex<VecDeque<StreamScript>>,
    channel_failures: Mutex<VecDeque<ChannelError>>,
    rejections: Mutex<VecDeque<String>>,
    open_streams: Mutex<HashSet<StreamId>>,
    requests: Mutex<Vec<TransportRequest>>,
    next_stream: AtomicU64,
}

impl ScriptedCoordinator {
    /// コーディネーターと、チャット側が所有するプッシュ受信口を作成
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let coordinator = Self {
            sender,
            scripts: Mutex::new(VecDeque::new()),
            channel_failures: Mutex::new(VecDeque::new()),
            rejections: Mutex::new(VecDeque::new()),
            open_streams: Mutex::new(HashSet::new()),
            requests: Mutex::new(Vec::new()),
            next_stream: AtomicU64::new(1),
        };
        (coordinator, receiver)
    }

    /// 次の `sendChatMessage` 用スクリプトを積む
    pub fn enqueue_script(&self, script: StreamScript) {
        self.scripts.lock().push_back(script);
    }

    /// 次のN回の送信をチャネルレベルで失敗させる
    pub fn fail_next(&self, times: usize, error: ChannelError) {
        let mut failures = self.channel_failures.lock();
        for _ in 0..times {
            failures.push_back(error.clone());
        }
    }

    /// 次の `sendChatMessage` を `success: false` で拒否する
    pub fn reject_next_send(&self, error: impl Into<String>) {
        self.rejections.lock().push_back(error.into());
    }

    /// 開いているストリームへチャンクを追加でプッシュ
    pub fn push(&self, stream_id: &StreamId, chunk: ChunkData) {
        let terminal = chunk.is_terminal();
        if self
            .sender
            .send(StreamEvent::new(stream_id.clone(), chunk))
            .is_err()
        {
            tracing::debug!(stream_id = %stream_id, "Push receiver dropped");
        }
        if terminal {
            self.open_streams.lock().remove(stream_id);
        }
    }

    /// 受信した全リクエスト（チャネル失敗分も含む）
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_with_action(&self, action: &str) -> Vec<TransportRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.action == action)
            .cloned()
            .collect()
    }

    pub fn is_open(&self, stream_id: &StreamId) -> bool {
        self.open_streams.lock().contains(stream_id)
    }

    fn start_stream(&self) -> serde_json::Value {
        if let Some(error) = self.rejections.lock().pop_front() {
            return json!({"success": false, "error": error});
        }

        let stream_id = StreamId(format!(
            "stream-{}",
            self.next_stream.fetch_add(1, Ordering::SeqCst)
        ));
        let script = self.scripts.lock().pop_front().unwrap_or_default();

        self.open_streams.lock().insert(stream_id.clone());
        for chunk in script.chunks {
            self.push(&stream_id, chunk);
        }

        tracing::debug!(stream_id = %stream_id, "📡 Scripted stream started");
        json!({"success": true, "streamId": stream_id.0})
    }

    fn cancel_stream(&self, request: &TransportRequest) -> serde_json::Value {
        let Some(stream_id) = request.field_str("streamId").map(StreamId::from) else {
            return json!({"success": false, "error": "streamId is required"});
        };

        if self.is_open(&stream_id) {
            self.push(&stream_id, ChunkData::cancelled());
            json!({"success": true})
        } else {
            json!({"success": false, "error": "stream is not active"})
        }
    }
}

#[async_trait]
impl MessageChannel for ScriptedCoordinator {
    async fn post(&self, request: &TransportRequest) -> Result<serde_json::Value, ChannelError> {
        self.requests.lock().push(request.clone());

        if let Some(error) = self.channel_failures.lock().pop_front() {
            return Err(error);
        }

        match request.action.as_str() {
            actions::SEND_CHAT_MESSAGE => Ok(self.start_stream()),
            actions::CANCEL_STREAM => Ok(self.cancel_stream(request)),
            other => Err(ChannelError::Other(format!("Unknown action: {}", other))),
        }
    }
}
