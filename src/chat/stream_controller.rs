//! ストリーミング応答のライフサイクル管理
//!
//! `Idle → Streaming → {Completed | Errored | Cancelled}`。
//! キャンセル要求を送ってから終端チャンクが届くまでは `Cancelling`。
//!
//! 本文と思考（reasoning）は別々のバッファに溜め、フラッシュ要求は
//! 保留中のものが無いときだけ1つ立てる（1ティック最大1回の描画）。

use crate::api::{ChunkData, StreamEvent, StreamId};
use crate::chat::events::TurnReport;
use crate::chat::models::{ChatMessage, ChatSession, SystemMessage};
use crate::database::StorageError;
use crate::ledger::tokenizer::{estimate_optional_tokens, estimate_tokens};
use crate::ledger::{LedgerBaseline, RateCard, StatisticsOptions, TokenLedger, TurnOutcome};

/// ストリームの状態
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamPhase {
    #[default]
    Idle,
    Streaming,
    /// キャンセル要求済み、終端チャンク待ち
    Cancelling,
    Completed,
    Errored,
    Cancelled,
}

impl StreamPhase {
    pub fn is_active(&self) -> bool {
        matches!(self, StreamPhase::Streaming | StreamPhase::Cancelling)
    }
}

/// ストリーミング中だけ存在する一時状態
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamState {
    pub message_id: String,
    pub buffered_text: String,
    pub buffered_thinking_text: String,
    pub pending_flush: bool,
}

/// フラッシュ時点の表示内容
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSnapshot {
    pub message_id: String,
    pub content: String,
    pub thinking: String,
}

/// 終端チャンクの種類（エラー > キャンセル > 完了）
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalChunk {
    Done {
        full_content: Option<String>,
        model: Option<String>,
    },
    Cancelled,
    Error(String),
}

impl TerminalChunk {
    pub fn from_chunk(chunk: &ChunkData) -> Option<Self> {
        if let Some(error) = &chunk.error {
            Some(TerminalChunk::Error(error.clone()))
        } else if chunk.cancelled {
            Some(TerminalChunk::Cancelled)
        } else if chunk.done {
            Some(TerminalChunk::Done {
                full_content: chunk.full_content.clone(),
                model: chunk.model.clone(),
            })
        } else {
            None
        }
    }

    pub fn outcome(&self) -> TurnOutcome {
        match self {
            TerminalChunk::Done { .. } => TurnOutcome::Completed,
            TerminalChunk::Cancelled => TurnOutcome::Cancelled,
            TerminalChunk::Error(_) => TurnOutcome::Errored,
        }
    }
}

/// チャンク処理の結果
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// 別ストリーム宛て、または非アクティブ
    Ignored,
    /// バッファに吸収（フラッシュは既に保留中）
    Absorbed,
    /// 新たにフラッシュを予約した
    FlushScheduled,
    Terminal(TerminalChunk),
}

/// 終端処理に必要なターン情報
#[derive(Debug, Clone, Copy, Default)]
pub struct TurnContext<'a> {
    pub platform_id: Option<&'a str>,
    pub model_id: Option<&'a str>,
    pub rate_card: Option<&'a RateCard>,
    pub system_prompt: Option<&'a str>,
    /// 再実行時の台帳ベースライン
    pub baseline: Option<LedgerBaseline>,
    pub cancel_marker: &'a str,
}

/// ストリームコントローラー
#[derive(Debug, Default)]
pub struct StreamController {
    phase: StreamPhase,
    stream_id: Option<StreamId>,
    state: Option<StreamState>,
}

impl StreamController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase.is_active()
    }

    pub fn is_cancelling(&self) -> bool {
        self.phase == StreamPhase::Cancelling
    }

    pub fn stream_id(&self) -> Option<&StreamId> {
        self.stream_id.as_ref()
    }

    pub fn state(&self) -> Option<&StreamState> {
        self.state.as_ref()
    }

    /// バックエンドがリクエストを受理した時点でストリーミングを開始
    pub fn begin(&mut self, message_id: impl Into<String>, stream_id: StreamId) {
        let message_id = message_id.into();
        tracing::debug!(stream_id = %stream_id, message_id = %message_id, "🎬 Stream started");

        self.phase = StreamPhase::Streaming;
        self.stream_id = Some(stream_id);
        self.state = Some(StreamState {
            message_id,
            ..Default::default()
        });
    }

    /// プッシュされたチャンクを処理
    pub fn on_chunk(&mut self, event: &StreamEvent) -> ChunkOutcome {
        if !self.is_active() || self.stream_id.as_ref() != Some(&event.stream_id) {
            tracing::debug!(stream_id = %event.stream_id, "Ignoring chunk for inactive stream");
            return ChunkOutcome::Ignored;
        }
        let Some(state) = self.state.as_mut() else {
            return ChunkOutcome::Ignored;
        };

        let chunk = &event.chunk_data;
        let mut appended = false;
        if let Some(text) = chunk.chunk.as_deref().filter(|t| !t.is_empty()) {
            state.buffered_text.push_str(text);
            appended = true;
        }
        if let Some(thinking) = chunk.thinking_chunk.as_deref().filter(|t| !t.is_empty()) {
            state.buffered_thinking_text.push_str(thinking);
            appended = true;
        }

        if let Some(terminal) = TerminalChunk::from_chunk(chunk) {
            return ChunkOutcome::Terminal(terminal);
        }

        if appended && !state.pending_flush {
            state.pending_flush = true;
            ChunkOutcome::FlushScheduled
        } else {
            ChunkOutcome::Absorbed
        }
    }

    /// 保留中のフラッシュを実行し、表示中メッセージへ反映
    pub fn flush(&mut self, session: &mut ChatSession) -> Option<StreamSnapshot> {
        let state = self.state.as_mut()?;
        if !state.pending_flush {
            return None;
        }
        state.pending_flush = false;

        let snapshot = StreamSnapshot {
            message_id: state.message_id.clone(),
            content: state.buffered_text.clone(),
            thinking: state.buffered_thinking_text.clone(),
        };

        if let Some(message) = session
            .find_mut(&snapshot.message_id)
            .and_then(ChatMessage::as_assistant_mut)
        {
            message.content = snapshot.content.clone();
            if !snapshot.thinking.is_empty() {
                message.thinking_content = Some(snapshot.thinking.clone());
            }
        }

        Some(snapshot)
    }

    /// キャンセル要求を開始（ストリーミング中のみ。二重呼び出しは何もしない）
    pub fn begin_cancel(&mut self) -> Option<StreamId> {
        if self.phase != StreamPhase::Streaming {
            return None;
        }
        self.phase = StreamPhase::Cancelling;
        self.stream_id.clone()
    }

    /// キャンセル要求の送信に失敗したらストリーミングへ戻す
    pub fn cancel_request_failed(&mut self) {
        if self.phase == StreamPhase::Cancelling {
            self.phase = StreamPhase::Streaming;
        }
    }

    /// 終端チャンクを受けてメッセージと台帳を確定
    ///
    /// 一時バッファは最初に取り出すので、途中で失敗しても次のターンへ持ち越さない。
    pub fn finalize(
        &mut self,
        terminal: TerminalChunk,
        session: &mut ChatSession,
        ledger: &TokenLedger,
        ctx: TurnContext<'_>,
    ) -> Result<Option<TurnReport>, StorageError> {
        let state = self.state.take();
        self.stream_id = None;
        self.phase = match terminal {
            TerminalChunk::Done { .. } => StreamPhase::Completed,
            TerminalChunk::Cancelled => StreamPhase::Cancelled,
            TerminalChunk::Error(_) => StreamPhase::Errored,
        };

        let Some(state) = state else {
            tracing::warn!("Terminal chunk arrived without stream state");
            return Ok(None);
        };

        let Some(index) = session.position(&state.message_id) else {
            tracing::warn!(
                message_id = %state.message_id,
                "Streaming message disappeared before finalization"
            );
            return Ok(None);
        };

        let outcome = terminal.outcome();
        match terminal {
            TerminalChunk::Done {
                full_content,
                model,
            } => {
                let content = full_content
                    .filter(|c| !c.is_empty())
                    .unwrap_or(state.buffered_text);
                let thinking = non_empty(state.buffered_thinking_text);
                let output_tokens =
                    estimate_tokens(&content) + estimate_optional_tokens(thinking.as_deref());
                let model_id = model.or_else(|| ctx.model_id.map(str::to_string));

                self.complete_assistant(
                    session,
                    index,
                    content,
                    thinking,
                    output_tokens,
                    model_id,
                    &ctx,
                );
                self.account(session, index, ledger, &ctx, outcome, output_tokens)
            }
            TerminalChunk::Cancelled => {
                let thinking = non_empty(state.buffered_thinking_text);
                // 部分出力のトークンは中断時点のバッファから数える
                let output_tokens = estimate_tokens(&state.buffered_text)
                    + estimate_optional_tokens(thinking.as_deref());
                let content = if state.buffered_text.is_empty() {
                    ctx.cancel_marker.to_string()
                } else {
                    format!("{}\n\n{}", state.buffered_text, ctx.cancel_marker)
                };
                let model_id = ctx.model_id.map(str::to_string);

                self.complete_assistant(
                    session,
                    index,
                    content,
                    thinking,
                    output_tokens,
                    model_id,
                    &ctx,
                );
                self.account(session, index, ledger, &ctx, outcome, output_tokens)
            }
            TerminalChunk::Error(error) => {
                let content = format!("Error: {}", error);
                session.messages[index] = ChatMessage::System(SystemMessage {
                    id: state.message_id.clone(),
                    content: content.clone(),
                    timestamp: chrono::Utc::now(),
                });
                tracing::warn!(
                    message_id = %state.message_id,
                    "⚠️ Stream ended with error: {}",
                    error
                );

                // 再実行中のエラーだけは台帳をベースラインへ巻き戻す（加算はしない）
                let statistics = match ctx.baseline {
                    Some(baseline) => Some(ledger.calculate_and_update_statistics(
                        session.id(),
                        &session.messages,
                        ctx.rate_card,
                        StatisticsOptions {
                            system_prompt: ctx.system_prompt,
                            baseline: Some(baseline),
                            outcome,
                        },
                    )?),
                    None => None,
                };

                Ok(Some(TurnReport {
                    message_id: state.message_id,
                    outcome,
                    content,
                    output_tokens: 0,
                    api_cost: None,
                    statistics,
                }))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn complete_assistant(
        &self,
        session: &mut ChatSession,
        index: usize,
        content: String,
        thinking: Option<String>,
        output_tokens: u64,
        model_id: Option<String>,
        ctx: &TurnContext<'_>,
    ) {
        if let Some(message) = session.messages[index].as_assistant_mut() {
            message.content = content;
            message.thinking_content = thinking;
            message.is_streaming = false;
            message.output_tokens = Some(output_tokens);
            message.model_id = model_id;
            if message.platform_id.is_none() {
                message.platform_id = ctx.platform_id.map(str::to_string);
            }
        }
    }

    fn account(
        &self,
        session: &mut ChatSession,
        index: usize,
        ledger: &TokenLedger,
        ctx: &TurnContext<'_>,
        outcome: TurnOutcome,
        output_tokens: u64,
    ) -> Result<Option<TurnReport>, StorageError> {
        let statistics = ledger.calculate_and_update_statistics(
            session.id(),
            &session.messages,
            ctx.rate_card,
            StatisticsOptions {
                system_prompt: ctx.system_prompt,
                baseline: ctx.baseline,
                outcome,
            },
        )?;

        let api_cost = ctx.rate_card.map(|_| statistics.last_api_call_cost);
        let message = &mut session.messages[index];
        if let Some(assistant) = message.as_assistant_mut() {
            assistant.api_cost = api_cost;
        }

        tracing::info!(
            message_id = message.id(),
            outcome = ?outcome,
            output_tokens,
            accumulated_cost = statistics.accumulated_cost,
            "✅ Turn finalized"
        );

        Ok(Some(TurnReport {
            message_id: message.id().to_string(),
            outcome,
            content: message.content().to_string(),
            output_tokens,
            api_cost,
            statistics: Some(statistics),
        }))
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryStorage;
    use std::sync::Arc;

    const MARKER: &str = "[Stream cancelled by user]";

    struct Fixture {
        controller: StreamController,
        session: ChatSession,
        ledger: TokenLedger,
        message_id: String,
        stream_id: StreamId,
    }

    fn fixture() -> Fixture {
        let mut session = ChatSession::new("tab-1", Some("openai".into()), Some("gpt-4o".into()));
        session.messages.push(ChatMessage::user("Hi", None));
        let placeholder = ChatMessage::streaming_placeholder(Some("openai".into()), None);
        let message_id = placeholder.id().to_string();
        session.messages.push(placeholder);

        let stream_id = StreamId::from("stream-1");
        let mut controller = StreamController::new();
        controller.begin(message_id.clone(), stream_id.clone());

        Fixture {
            controller,
            session,
            ledger: TokenLedger::new(Arc::new(MemoryStorage::new())),
            message_id,
            stream_id,
        }
    }

    fn ctx<'a>(rate_card: Option<&'a RateCard>) -> TurnContext<'a> {
        TurnContext {
            platform_id: Some("openai"),
            model_id: Some("gpt-4o"),
            rate_card,
            system_prompt: None,
            baseline: None,
            cancel_marker: MARKER,
        }
    }

    fn event(stream_id: &StreamId, chunk: ChunkData) -> StreamEvent {
        StreamEvent::new(stream_id.clone(), chunk)
    }

    fn finish(f: &mut Fixture, chunk: ChunkData, card: Option<&RateCard>) -> TurnReport {
        let ChunkOutcome::Terminal(terminal) = f.controller.on_chunk(&event(&f.stream_id, chunk))
        else {
            panic!("expected terminal chunk");
        };
        f.controller
            .finalize(terminal, &mut f.session, &f.ledger, ctx(card))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_at_most_one_pending_flush() {
        let mut f = fixture();

        let first = f.controller.on_chunk(&event(&f.stream_id, ChunkData::text("a")));
        let second = f.controller.on_chunk(&event(&f.stream_id, ChunkData::text("b")));
        let third = f.controller.on_chunk(&event(&f.stream_id, ChunkData::thinking("t")));

        assert_eq!(first, ChunkOutcome::FlushScheduled);
        assert_eq!(second, ChunkOutcome::Absorbed);
        assert_eq!(third, ChunkOutcome::Absorbed);

        let snapshot = f.controller.flush(&mut f.session).unwrap();
        assert_eq!(snapshot.content, "ab");
        assert_eq!(snapshot.thinking, "t");
        assert!(f.controller.flush(&mut f.session).is_none());

        // フラッシュ後は再び予約できる
        let fourth = f.controller.on_chunk(&event(&f.stream_id, ChunkData::text("c")));
        assert_eq!(fourth, ChunkOutcome::FlushScheduled);

        let message = f.session.find(&f.message_id).unwrap();
        assert_eq!(message.content(), "ab");
        assert!(message.is_streaming());
    }

    #[test]
    fn test_foreign_stream_chunks_are_ignored() {
        let mut f = fixture();
        let other = StreamId::from("stream-99");

        let outcome = f.controller.on_chunk(&event(&other, ChunkData::text("x")));

        assert_eq!(outcome, ChunkOutcome::Ignored);
        assert!(f.controller.state().unwrap().buffered_text.is_empty());
    }

    #[test]
    fn test_done_prefers_full_content() {
        let mut f = fixture();
        f.controller.on_chunk(&event(&f.stream_id, ChunkData::text("Hel")));
        f.controller.on_chunk(&event(&f.stream_id, ChunkData::text("lo")));

        let report = finish(
            &mut f,
            ChunkData::done(Some("Hello".into()), Some("gpt-4o-mini".into())),
            None,
        );

        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert_eq!(report.content, "Hello");
        let message = f.session.find(&f.message_id).unwrap().as_assistant().unwrap();
        assert_eq!(message.content, "Hello");
        assert!(!message.is_streaming);
        assert_eq!(message.model_id.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(message.output_tokens, Some(estimate_tokens("Hello")));
        assert_eq!(message.api_cost, None);
        assert_eq!(f.controller.phase(), StreamPhase::Completed);
        assert!(f.controller.state().is_none());
    }

    #[test]
    fn test_done_without_full_content_uses_buffer_and_counts_thinking() {
        let mut f = fixture();
        f.controller.on_chunk(&event(&f.stream_id, ChunkData::thinking("Let me think")));
        f.controller.on_chunk(&event(&f.stream_id, ChunkData::text("Answer")));

        let card = RateCard::new(1.0, 2.0);
        let report = finish(&mut f, ChunkData::done(None, None), Some(&card));

        let message = f.session.find(&f.message_id).unwrap().as_assistant().unwrap();
        assert_eq!(message.content, "Answer");
        assert_eq!(message.thinking_content.as_deref(), Some("Let me think"));
        assert_eq!(
            message.output_tokens,
            Some(estimate_tokens("Answer") + estimate_tokens("Let me think"))
        );
        assert_eq!(message.model_id.as_deref(), Some("gpt-4o"));
        assert!(message.api_cost.unwrap() > 0.0);
        assert_eq!(report.api_cost, message.api_cost);
    }

    #[test]
    fn test_error_turns_message_into_system_without_cost() {
        let mut f = fixture();
        f.controller.on_chunk(&event(&f.stream_id, ChunkData::thinking("hmm")));
        f.controller.on_chunk(&event(&f.stream_id, ChunkData::text("partial")));

        let card = RateCard::new(1.0, 2.0);
        let report = finish(&mut f, ChunkData::failed("rate limited"), Some(&card));

        assert_eq!(report.outcome, TurnOutcome::Errored);
        assert_eq!(report.output_tokens, 0);
        assert!(report.statistics.is_none());

        let message = f.session.find(&f.message_id).unwrap();
        assert!(matches!(message, ChatMessage::System(_)));
        assert_eq!(message.content(), "Error: rate limited");
        assert!(!f.ledger.get_statistics("tab-1").unwrap().is_calculated);
        assert_eq!(f.controller.phase(), StreamPhase::Errored);
    }

    #[test]
    fn test_cancel_counts_partial_output_and_appends_marker() {
        let mut f = fixture();
        f.controller.on_chunk(&event(&f.stream_id, ChunkData::text("Partial answer")));

        assert_eq!(f.controller.begin_cancel(), Some(f.stream_id.clone()));
        assert!(f.controller.is_cancelling());
        // 二重キャンセルは何もしない
        assert_eq!(f.controller.begin_cancel(), None);

        let card = RateCard::new(1.0, 2.0);
        let report = finish(&mut f, ChunkData::cancelled(), Some(&card));

        assert_eq!(report.outcome, TurnOutcome::Cancelled);
        assert_eq!(report.output_tokens, estimate_tokens("Partial answer"));
        let message = f.session.find(&f.message_id).unwrap().as_assistant().unwrap();
        assert_eq!(message.content, format!("Partial answer\n\n{}", MARKER));
        assert!(message.api_cost.unwrap() > 0.0);
        assert!(!message.is_streaming);
        assert_eq!(f.controller.phase(), StreamPhase::Cancelled);
    }

    #[test]
    fn test_cancel_is_noop_when_idle() {
        let mut controller = StreamController::new();
        assert_eq!(controller.begin_cancel(), None);
        assert_eq!(controller.phase(), StreamPhase::Idle);
    }

    #[test]
    fn test_failed_cancel_request_returns_to_streaming() {
        let mut f = fixture();
        f.controller.begin_cancel();
        f.controller.cancel_request_failed();
        assert_eq!(f.controller.phase(), StreamPhase::Streaming);
    }

    #[test]
    fn test_buffers_are_cleared_even_if_message_vanished() {
        let mut f = fixture();
        f.controller.on_chunk(&event(&f.stream_id, ChunkData::text("orphan")));
        f.session.messages.clear();

        let ChunkOutcome::Terminal(terminal) = f
            .controller
            .on_chunk(&event(&f.stream_id, ChunkData::done(None, None)))
        else {
            panic!("expected terminal");
        };
        let report = f
            .controller
            .finalize(terminal, &mut f.session, &f.ledger, ctx(None))
            .unwrap();

        assert!(report.is_none());
        assert!(f.controller.state().is_none());
        assert!(!f.controller.is_active());
    }
}
