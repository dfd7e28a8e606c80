//! チャットサービス
//!
//! 1つの会話（タブ）につき1インスタンス。送信・キャンセル・ストリーム駆動・
//! 永続化をまとめ、状態変更を `ChatBroadcaster` で通知する。
//! ストリームは同時に1本だけ（`StreamController` がアクティブな間は送信を拒否）。

use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::events::{ChatBroadcaster, ChatEvent, TurnReport};
use super::models::{ChatMessage, ChatSession};
use super::rewinder::RollbackReference;
use super::stream_controller::{
    ChunkOutcome, StreamController, StreamPhase, TerminalChunk, TurnContext,
};
use super::ticker::FlushTicker;
use crate::api::{
    actions, MessageChannel, StreamEvent, StreamId, Transport, TransportError, TransportRequest,
};
use crate::config::{ModelProfile, StreamConfig};
use crate::database::{ChatSessionStore, StorageBackend, StorageError};
use crate::error::{TabchatError, TabchatResult};
use crate::ledger::{
    calculate_context_status, estimate_tokens, project_context_status, ContextStatus, RateCard,
    StatisticsOptions, TokenLedger, TokenStatistics, TurnOutcome, WarningLevel,
};

/// プッシュチャネルが閉じた時のエラー文言
pub const STREAM_CHANNEL_CLOSED: &str = "stream channel closed";

/// 現在選択中のプラットフォーム・モデル
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatContext {
    pub platform_id: Option<String>,
    pub model_id: Option<String>,
    pub has_credentials: bool,
    pub system_prompt: Option<String>,
    pub rate_card: Option<RateCard>,
    pub context_window: Option<u64>,
}

impl ChatContext {
    pub fn from_profile(profile: &ModelProfile, has_credentials: bool) -> Self {
        Self {
            platform_id: Some(profile.platform_id.clone()),
            model_id: Some(profile.model_id.clone()),
            has_credentials,
            system_prompt: None,
            rate_card: profile.pricing.clone(),
            context_window: profile.context_window,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

/// ストリーム駆動中に外から送る制御
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    Cancel,
    /// グローバルなEscキー入力
    Escape,
}

/// `run_stream` 実行中でもキャンセルできるハンドル
#[derive(Debug, Clone)]
pub struct StreamControlHandle {
    sender: mpsc::UnboundedSender<StreamControl>,
}

impl StreamControlHandle {
    pub fn cancel(&self) -> bool {
        self.sender.send(StreamControl::Cancel).is_ok()
    }

    pub fn escape(&self) -> bool {
        self.sender.send(StreamControl::Escape).is_ok()
    }
}

/// チャットサービス
pub struct ChatService<C> {
    transport: Transport<C>,
    store: ChatSessionStore,
    ledger: TokenLedger,
    context: ChatContext,
    stream_config: StreamConfig,
    session: ChatSession,
    controller: StreamController,
    chunk_receiver: mpsc::UnboundedReceiver<StreamEvent>,
    control_sender: mpsc::UnboundedSender<StreamControl>,
    control_receiver: mpsc::UnboundedReceiver<StreamControl>,
    broadcaster: ChatBroadcaster,
    rollback: Option<RollbackReference>,
}

impl<C: MessageChannel> ChatService<C> {
    /// 新しい会話で開始する
    pub fn new(
        transport: Transport<C>,
        chunk_receiver: mpsc::UnboundedReceiver<StreamEvent>,
        storage: Arc<dyn StorageBackend>,
        context: ChatContext,
    ) -> Self {
        let (control_sender, control_receiver) = mpsc::unbounded_channel();
        let session = ChatSession::new(
            Uuid::new_v4().to_string(),
            context.platform_id.clone(),
            context.model_id.clone(),
        );

        Self {
            transport,
            store: ChatSessionStore::new(storage.clone()),
            ledger: TokenLedger::new(storage),
            context,
            stream_config: StreamConfig::default(),
            session,
            controller: StreamController::new(),
            chunk_receiver,
            control_sender,
            control_receiver,
            broadcaster: ChatBroadcaster::new(),
            rollback: None,
        }
    }

    pub fn with_stream_config(mut self, stream_config: StreamConfig) -> Self {
        self.stream_config = stream_config;
        self
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    pub fn context(&self) -> &ChatContext {
        &self.context
    }

    pub fn ledger(&self) -> &TokenLedger {
        &self.ledger
    }

    pub fn phase(&self) -> StreamPhase {
        self.controller.phase()
    }

    pub fn is_streaming(&self) -> bool {
        self.controller.is_active()
    }

    pub fn active_stream_id(&self) -> Option<&StreamId> {
        self.controller.stream_id()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.broadcaster.subscribe()
    }

    pub fn control_handle(&self) -> StreamControlHandle {
        StreamControlHandle {
            sender: self.control_sender.clone(),
        }
    }

    /// プラットフォーム・モデルの切り替え（ストリーミング中は不可）
    pub fn set_context(&mut self, context: ChatContext) -> TabchatResult<()> {
        self.ensure_idle()?;
        self.context = context;
        Ok(())
    }

    /// ユーザーメッセージを送信してストリーミングを開始
    ///
    /// コンテキストが無効化されていた場合は `Ok(None)`（何も表示しない）。
    pub async fn send(&mut self, text: &str) -> TabchatResult<Option<StreamId>> {
        let prompt = text.trim();
        if prompt.is_empty() {
            return Err(TabchatError::validation("message is empty"));
        }
        self.ensure_ready()?;

        let projected = project_context_status(
            &self.session.messages,
            prompt,
            self.context.system_prompt.as_deref(),
            self.context.context_window,
        );
        self.warn_if_near_limit(projected);

        let user = ChatMessage::user(prompt, Some(estimate_tokens(prompt)));
        self.broadcaster.broadcast(ChatEvent::MessageAppended {
            message_id: user.id().to_string(),
            count: self.session.messages.len() + 1,
        });
        self.session.messages.push(user);

        let prompt_index = self.session.messages.len() - 1;
        self.begin_turn(prompt_index).await
    }

    /// ストリームのキャンセルを要求（ストリーミング中でなければ何もしない）
    ///
    /// 実際の終了は終端チャンクの処理で行われる。
    pub async fn cancel(&mut self) -> TabchatResult<bool> {
        let Some(stream_id) = self.controller.begin_cancel() else {
            tracing::debug!(phase = ?self.controller.phase(), "Cancel ignored");
            return Ok(false);
        };

        tracing::info!(stream_id = %stream_id, "🛑 Requesting stream cancellation");
        let request =
            TransportRequest::new(actions::CANCEL_STREAM).with_field("streamId", &stream_id.0)?;

        match self.transport.send(request).await {
            Ok(response) if response.is_empty() || response.is_success() => Ok(true),
            Ok(response) => {
                // 終端チャンクが先に届いている場合など
                tracing::warn!(
                    stream_id = %stream_id,
                    error = response.error_message().unwrap_or("unknown"),
                    "Cancel request was refused"
                );
                self.controller.cancel_request_failed();
                Ok(false)
            }
            Err(e) => {
                tracing::warn!(stream_id = %stream_id, "❌ Cancel request failed: {}", e);
                self.controller.cancel_request_failed();
                Err(e.into())
            }
        }
    }

    /// Escキー: ストリーミング中かつキャンセル処理中でなければキャンセル
    pub async fn handle_escape(&mut self) -> TabchatResult<bool> {
        if self.controller.phase() != StreamPhase::Streaming {
            return Ok(false);
        }
        self.cancel().await
    }

    /// 既に届いているチャンクだけを処理（待たない）
    ///
    /// 最後に保留中のフラッシュを1回実行する。
    pub fn drain_available(&mut self) -> TabchatResult<Option<TurnReport>> {
        loop {
            match self.chunk_receiver.try_recv() {
                Ok(event) => {
                    if let Some(report) = self.handle_event(event)? {
                        return Ok(Some(report));
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return self.finish_closed_channel(),
            }
        }
        self.flush_pending();
        Ok(None)
    }

    /// 終端チャンクが届くまでストリームを駆動
    ///
    /// 制御 > チャンク > ティックの優先順で処理し、ティックごとに最大1回フラッシュする。
    pub async fn run_stream(&mut self) -> TabchatResult<Option<TurnReport>> {
        if !self.controller.is_active() {
            return Ok(None);
        }

        let mut ticker = FlushTicker::from_millis(self.stream_config.flush_interval_ms);
        loop {
            tokio::select! {
                biased;

                Some(control) = self.control_receiver.recv() => {
                    self.apply_control(control).await;
                }

                event = self.chunk_receiver.recv() => {
                    match event {
                        Some(event) => {
                            if let Some(report) = self.handle_event(event)? {
                                return Ok(Some(report));
                            }
                        }
                        None => return self.finish_closed_channel(),
                    }
                }

                _ = ticker.tick() => {
                    self.flush_pending();
                }
            }
        }
    }

    /// 新しい会話を開始（保存は最初の送信時）
    pub fn new_chat(&mut self, session_id: impl Into<String>) -> TabchatResult<()> {
        self.ensure_idle()?;
        self.session = ChatSession::new(
            session_id,
            self.context.platform_id.clone(),
            self.context.model_id.clone(),
        );
        self.rollback = None;
        self.broadcaster.broadcast(ChatEvent::SessionLoaded {
            session_id: self.session.id().to_string(),
            count: 0,
        });
        Ok(())
    }

    /// 保存済みの会話を読み込む。無ければ空の会話として開始し `false` を返す
    pub fn load_session(&mut self, session_id: &str) -> TabchatResult<bool> {
        self.ensure_idle()?;
        let found = match self.store.load(session_id)? {
            Some(session) => {
                self.session = session;
                true
            }
            None => {
                self.session = ChatSession::new(
                    session_id,
                    self.context.platform_id.clone(),
                    self.context.model_id.clone(),
                );
                false
            }
        };
        self.rollback = None;
        self.broadcaster.broadcast(ChatEvent::SessionLoaded {
            session_id: session_id.to_string(),
            count: self.session.messages.len(),
        });
        Ok(found)
    }

    /// 会話とそのトークン統計を削除
    pub fn clear_conversation(&mut self) -> TabchatResult<()> {
        self.ensure_idle()?;
        let session_id = self.session.id().to_string();

        self.store.delete(&session_id)?;
        self.ledger.remove_statistics(&session_id)?;
        self.session.messages.clear();
        self.rollback = None;

        tracing::info!(session_id = %session_id, "🧹 Conversation cleared");
        self.broadcaster
            .broadcast(ChatEvent::SessionCleared { session_id });
        Ok(())
    }

    pub fn statistics(&self) -> TabchatResult<TokenStatistics> {
        Ok(self.ledger.get_statistics(self.session.id())?)
    }

    pub fn context_status(&self) -> TabchatResult<ContextStatus> {
        let statistics = self.statistics()?;
        Ok(calculate_context_status(
            &statistics,
            self.context.context_window,
        ))
    }

    /// 送信・再実行の前提条件
    pub(super) fn ensure_ready(&self) -> TabchatResult<()> {
        if self.context.platform_id.is_none() {
            return Err(TabchatError::not_configured("platform"));
        }
        if self.context.model_id.is_none() {
            return Err(TabchatError::not_configured("model"));
        }
        if !self.context.has_credentials {
            return Err(TabchatError::not_configured("credentials"));
        }
        self.ensure_idle()
    }

    fn ensure_idle(&self) -> TabchatResult<()> {
        if self.controller.is_active() {
            return Err(TabchatError::StreamBusy);
        }
        Ok(())
    }

    pub(super) fn session_mut(&mut self) -> &mut ChatSession {
        &mut self.session
    }

    pub(super) fn set_rollback(&mut self, rollback: RollbackReference) {
        self.rollback = Some(rollback);
    }

    /// 再実行のロールバック参照が未消費のまま残っているか
    pub fn has_pending_rollback(&self) -> bool {
        self.rollback.is_some()
    }

    /// `prompt_index` のユーザーメッセージに対する応答を開始
    ///
    /// プレースホルダーを追加して保存してからバックエンドを呼ぶ。
    /// 呼び出しに失敗した場合はプレースホルダーをエラーメッセージに置き換えて保存する。
    pub(super) async fn begin_turn(
        &mut self,
        prompt_index: usize,
    ) -> TabchatResult<Option<StreamId>> {
        let placeholder = ChatMessage::streaming_placeholder(
            self.context.platform_id.clone(),
            self.context.model_id.clone(),
        );
        let message_id = placeholder.id().to_string();
        self.session.messages.push(placeholder);
        self.broadcaster.broadcast(ChatEvent::MessageAppended {
            message_id: message_id.clone(),
            count: self.session.messages.len(),
        });

        if let Err(e) = self.persist() {
            self.rollback = None;
            return Err(e);
        }

        let request = match self.build_chat_request(prompt_index, &message_id) {
            Ok(request) => request,
            Err(e) => return self.abort_turn(&message_id, e),
        };

        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(e) => return self.abort_turn(&message_id, e),
        };

        if response.is_empty() {
            // 呼び出し元のコンテキストはもう存在しないので表示も保存もしない
            tracing::debug!(message_id = %message_id, "Context invalidated, dropping turn");
            self.session.messages.retain(|m| m.id() != message_id);
            if let Some(rollback) = self.rollback.take() {
                if let Err(e) = self.rewind_ledger(&rollback) {
                    tracing::debug!("Failed to rewind statistics for dropped turn: {}", e);
                }
            }
            // 保存済みのプレースホルダーも消しておく（失敗しても通知しない）
            if let Err(e) = self.store.save(&mut self.session) {
                tracing::debug!("Failed to persist dropped turn: {}", e);
            }
            return Ok(None);
        }

        match response.stream_id().filter(|_| response.is_success()) {
            Some(stream_id) => {
                self.controller.begin(message_id, stream_id.clone());
                Ok(Some(stream_id))
            }
            None => {
                let message = response
                    .error_message()
                    .unwrap_or("Failed to start stream")
                    .to_string();
                self.abort_turn(&message_id, TransportError::Rejected { message })
            }
        }
    }

    fn build_chat_request(
        &self,
        prompt_index: usize,
        message_id: &str,
    ) -> Result<TransportRequest, TransportError> {
        let prompt = self
            .session
            .messages
            .get(prompt_index)
            .map(ChatMessage::content)
            .unwrap_or_default();

        TransportRequest::new(actions::SEND_CHAT_MESSAGE)
            .with_field("messageId", message_id)?
            .with_field("platformId", &self.context.platform_id)?
            .with_field("modelId", &self.context.model_id)?
            .with_field("systemPrompt", &self.context.system_prompt)?
            .with_field("message", prompt)?
            .with_field("messages", self.session.history(prompt_index))
    }

    /// バックエンド呼び出しの失敗をシステムメッセージとして残す
    fn abort_turn(
        &mut self,
        message_id: &str,
        error: TransportError,
    ) -> TabchatResult<Option<StreamId>> {
        tracing::error!(message_id, "❌ Failed to start stream: {}", error);
        let rollback = self.rollback.take();

        let system = ChatMessage::system(format!("Error: {}", error));
        match self.session.position(message_id) {
            Some(index) => self.session.messages[index] = system,
            None => self.session.messages.push(system),
        }

        // 再実行の失敗はエラーチャンクと同じく切り詰め地点の値へ戻す
        if let Some(rollback) = rollback {
            match self.rewind_ledger(&rollback) {
                Ok(statistics) => self
                    .broadcaster
                    .broadcast(ChatEvent::StatisticsUpdated(statistics)),
                Err(e) => return Err(self.recover_from_persistence_failure(e)),
            }
        }
        self.persist()?;

        Err(error.into())
    }

    /// 台帳を切り詰め地点の累積値で上書き（このターンの加算なし）
    fn rewind_ledger(
        &self,
        rollback: &RollbackReference,
    ) -> Result<TokenStatistics, StorageError> {
        self.ledger.calculate_and_update_statistics(
            self.session.id(),
            &self.session.messages,
            self.context.rate_card.as_ref(),
            StatisticsOptions {
                system_prompt: self.context.system_prompt.as_deref(),
                baseline: Some(rollback.baseline()),
                outcome: TurnOutcome::Errored,
            },
        )
    }

    async fn apply_control(&mut self, control: StreamControl) {
        let result = match control {
            StreamControl::Cancel => self.cancel().await,
            StreamControl::Escape => self.handle_escape().await,
        };
        if let Err(e) = result {
            tracing::warn!(control = ?control, "Stream control failed: {}", e);
        }
    }

    fn handle_event(&mut self, event: StreamEvent) -> TabchatResult<Option<TurnReport>> {
        match self.controller.on_chunk(&event) {
            ChunkOutcome::Terminal(terminal) => self.finish_turn(terminal),
            ChunkOutcome::Ignored | ChunkOutcome::Absorbed | ChunkOutcome::FlushScheduled => {
                Ok(None)
            }
        }
    }

    fn finish_closed_channel(&mut self) -> TabchatResult<Option<TurnReport>> {
        if !self.controller.is_active() {
            return Ok(None);
        }
        tracing::warn!("Push channel closed while streaming");
        self.finish_turn(TerminalChunk::Error(STREAM_CHANNEL_CLOSED.to_string()))
    }

    fn flush_pending(&mut self) -> bool {
        match self.controller.flush(&mut self.session) {
            Some(snapshot) => {
                self.broadcaster.broadcast(ChatEvent::StreamUpdated {
                    message_id: snapshot.message_id,
                    content: snapshot.content,
                    thinking: snapshot.thinking,
                });
                true
            }
            None => false,
        }
    }

    /// 終端チャンクでターンを確定し、保存して通知
    fn finish_turn(&mut self, terminal: TerminalChunk) -> TabchatResult<Option<TurnReport>> {
        // ロールバック参照は結果に関わらずここで使い切る
        let baseline = self.rollback.take().map(|r| r.baseline());
        let ctx = TurnContext {
            platform_id: self.context.platform_id.as_deref(),
            model_id: self.context.model_id.as_deref(),
            rate_card: self.context.rate_card.as_ref(),
            system_prompt: self.context.system_prompt.as_deref(),
            baseline,
            cancel_marker: &self.stream_config.cancel_marker,
        };

        let finalized = self
            .controller
            .finalize(terminal, &mut self.session, &self.ledger, ctx);

        let report = match finalized {
            Ok(report) => report,
            Err(e) => return Err(self.recover_from_persistence_failure(e)),
        };

        self.persist()?;

        let Some(report) = report else {
            return Ok(None);
        };

        if let Some(statistics) = &report.statistics {
            self.broadcaster
                .broadcast(ChatEvent::StatisticsUpdated(statistics.clone()));
            let status = calculate_context_status(statistics, self.context.context_window);
            self.warn_if_near_limit(status);
        }
        self.broadcaster
            .broadcast(ChatEvent::TurnFinished(report.clone()));

        Ok(Some(report))
    }

    fn warn_if_near_limit(&self, status: ContextStatus) {
        if status.warning_level >= WarningLevel::Warning {
            tracing::warn!(
                tokens_used = status.tokens_used,
                context_window = status.context_window,
                level = ?status.warning_level,
                "⚠️ Context window is filling up"
            );
            self.broadcaster.broadcast(ChatEvent::ContextWarning(status));
        }
    }

    /// セッション全体を保存。失敗時は最後に保存された状態へ戻す
    fn persist(&mut self) -> TabchatResult<()> {
        match self.store.save(&mut self.session) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.recover_from_persistence_failure(e)),
        }
    }

    fn recover_from_persistence_failure(&mut self, error: StorageError) -> TabchatError {
        let session_id = self.session.id().to_string();
        tracing::error!(session_id = %session_id, "❌ Failed to persist session: {}", error);
        self.broadcaster.broadcast(ChatEvent::PersistenceFailed {
            reason: error.to_string(),
        });

        match self.store.load(&session_id) {
            Ok(Some(session)) => self.session = session,
            Ok(None) => {
                self.session = ChatSession::new(
                    session_id,
                    self.context.platform_id.clone(),
                    self.context.model_id.clone(),
                );
            }
            Err(reload_error) => {
                tracing::error!("❌ Failed to reload session after save error: {}", reload_error);
            }
        }

        TabchatError::Storage(error)
    }
}
