//! 再実行・編集して再実行
//!
//! 指定したターンで会話を切り詰め、台帳を切り詰め時点の状態へ巻き戻してから
//! バックエンドを呼び直す。巻き戻し先は切り詰め後に残るアシスタントメッセージに
//! 記録された料金・出力トークンの合計。

use crate::api::{MessageChannel, StreamId};
use crate::chat::models::ChatMessage;
use crate::chat::service::ChatService;
use crate::error::{TabchatError, TabchatResult};
use crate::ledger::{estimate_tokens, LedgerBaseline};

/// 切り詰め時点の台帳の値
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RollbackReference {
    pub pre_truncation_cost: f64,
    pub pre_truncation_output: u64,
}

impl RollbackReference {
    /// 残るメッセージに記録された各ターンの値を合計
    pub fn from_messages(messages: &[ChatMessage]) -> Self {
        messages
            .iter()
            .filter_map(ChatMessage::as_assistant)
            .fold(Self::default(), |acc, assistant| Self {
                pre_truncation_cost: acc.pre_truncation_cost + assistant.api_cost.unwrap_or(0.0),
                pre_truncation_output: acc.pre_truncation_output
                    + assistant.output_tokens.unwrap_or(0),
            })
    }

    pub fn baseline(&self) -> LedgerBaseline {
        LedgerBaseline {
            initial_accumulated_cost: self.pre_truncation_cost,
            initial_output_tokens: self.pre_truncation_output,
        }
    }
}

/// 巻き戻し計画
#[derive(Debug, Clone, PartialEq)]
pub struct RewindPlan {
    /// 再送するユーザーメッセージの位置
    pub prompt_index: usize,
    /// 切り詰め後のメッセージ数（プロンプトまでを含む）
    pub truncate_len: usize,
    pub rollback: RollbackReference,
}

impl RewindPlan {
    fn at(messages: &[ChatMessage], prompt_index: usize) -> Self {
        Self {
            prompt_index,
            truncate_len: prompt_index + 1,
            rollback: RollbackReference::from_messages(&messages[..prompt_index]),
        }
    }

    /// ユーザーメッセージから再実行。見つからない・ユーザーでない場合は None
    pub fn for_user_message(messages: &[ChatMessage], message_id: &str) -> Option<Self> {
        let index = messages.iter().position(|m| m.id() == message_id)?;
        messages[index].as_user()?;
        Some(Self::at(messages, index))
    }

    /// アシスタントメッセージから再実行
    ///
    /// 直前がユーザーメッセージでなければ構造エラー。対象が見つからなければ None。
    pub fn for_assistant_message(
        messages: &[ChatMessage],
        message_id: &str,
    ) -> TabchatResult<Option<Self>> {
        let Some(index) = messages.iter().position(|m| m.id() == message_id) else {
            return Ok(None);
        };
        if messages[index].as_assistant().is_none() {
            return Ok(None);
        }

        let prompt_index = index
            .checked_sub(1)
            .filter(|&i| messages[i].as_user().is_some())
            .ok_or_else(|| {
                TabchatError::validation(format!(
                    "assistant message {} is not preceded by a user message",
                    message_id
                ))
            })?;

        Ok(Some(Self::at(messages, prompt_index)))
    }
}

impl<C: MessageChannel> ChatService<C> {
    /// ユーザーメッセージを再実行
    ///
    /// 対象が無い・ユーザーメッセージでない場合は何もせず `Ok(false)`。
    pub async fn rerun(&mut self, message_id: &str) -> TabchatResult<bool> {
        self.ensure_ready()?;

        let Some(plan) = RewindPlan::for_user_message(&self.session().messages, message_id) else {
            tracing::warn!(message_id, "Rerun target not found or not a user message");
            return Ok(false);
        };

        self.execute_rewind(plan, None).await?;
        Ok(true)
    }

    /// ユーザーメッセージを編集して再実行（空白のみは何もしない）
    pub async fn edit_and_rerun(
        &mut self,
        message_id: &str,
        new_content: &str,
    ) -> TabchatResult<bool> {
        let content = new_content.trim();
        if content.is_empty() {
            tracing::debug!(message_id, "Edit ignored: empty content");
            return Ok(false);
        }
        self.ensure_ready()?;

        let Some(plan) = RewindPlan::for_user_message(&self.session().messages, message_id) else {
            tracing::warn!(message_id, "Edit target not found or not a user message");
            return Ok(false);
        };

        self.execute_rewind(plan, Some(content.to_string())).await?;
        Ok(true)
    }

    /// アシスタントの応答を再生成
    pub async fn rerun_assistant_message(&mut self, message_id: &str) -> TabchatResult<bool> {
        self.ensure_ready()?;

        let plan = match RewindPlan::for_assistant_message(&self.session().messages, message_id) {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                tracing::warn!(message_id, "Rerun target not found or not an assistant message");
                return Ok(false);
            }
            Err(e) => {
                tracing::warn!(message_id, "❌ Cannot rerun assistant message: {}", e);
                return Err(e);
            }
        };

        self.execute_rewind(plan, None).await?;
        Ok(true)
    }

    async fn execute_rewind(
        &mut self,
        plan: RewindPlan,
        edited: Option<String>,
    ) -> TabchatResult<Option<StreamId>> {
        let session = self.session_mut();
        let discarded = session.messages.len().saturating_sub(plan.truncate_len);
        session.messages.truncate(plan.truncate_len);

        if let Some(content) = edited {
            if let ChatMessage::User(user) = &mut session.messages[plan.prompt_index] {
                user.input_tokens = Some(estimate_tokens(&content));
                user.content = content;
            }
        }

        tracing::info!(
            prompt_index = plan.prompt_index,
            discarded,
            baseline_cost = plan.rollback.pre_truncation_cost,
            baseline_output = plan.rollback.pre_truncation_output,
            "⏪ Rewinding conversation"
        );

        self.set_rollback(plan.rollback);
        self.begin_turn(plan.prompt_index).await
    }
}
