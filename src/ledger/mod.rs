//! トークン台帳
//!
//! トークン数の推定、料金計算、セッションごとの累積統計を扱う。
//! 永続化されたトークン統計を書き込むのは `TokenLedger` だけ。

pub mod context;
pub mod pricing;
pub mod statistics;
pub mod tokenizer;

pub use context::{calculate_context_status, project_context_status, ContextStatus, WarningLevel};
pub use pricing::{calculate_cost, CostBreakdown, RateCard};
pub use statistics::{calculate_token_statistics_from_messages, TokenStatistics};
pub use tokenizer::estimate_tokens;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::chat::models::ChatMessage;
use crate::database::{StorageBackend, StorageError, TOKEN_STATISTICS_KEY};

/// ターンの終わり方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnOutcome {
    Completed,
    Cancelled,
    Errored,
}

/// 台帳のベースライン（このターンより前に「使用済み」とみなす値）
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerBaseline {
    pub initial_accumulated_cost: f64,
    pub initial_output_tokens: u64,
}

/// 統計更新のオプション
#[derive(Debug, Clone, Copy)]
pub struct StatisticsOptions<'a> {
    pub system_prompt: Option<&'a str>,
    /// 明示的なベースライン（再実行時）。Noneなら記録済みの統計を使う
    pub baseline: Option<LedgerBaseline>,
    pub outcome: TurnOutcome,
}

impl Default for StatisticsOptions<'_> {
    fn default() -> Self {
        Self {
            system_prompt: None,
            baseline: None,
            outcome: TurnOutcome::Completed,
        }
    }
}

type StatisticsMap = BTreeMap<String, TokenStatistics>;

/// トークン台帳
#[derive(Clone)]
pub struct TokenLedger {
    storage: Arc<dyn StorageBackend>,
}

impl TokenLedger {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// 記録済みの統計を取得（なければ初期値）
    pub fn get_statistics(&self, session_id: &str) -> Result<TokenStatistics, StorageError> {
        Ok(self
            .load_map()?
            .remove(session_id)
            .unwrap_or_default())
    }

    /// ターン完了（またはキャンセル）後に統計を計算して保存する
    ///
    /// 新しい累積値 = ベースライン + このターンの値。
    /// エラーで終わったターンは出力トークン・料金とも0として扱う。
    pub fn calculate_and_update_statistics(
        &self,
        session_id: &str,
        messages: &[ChatMessage],
        rate_card: Option<&RateCard>,
        options: StatisticsOptions<'_>,
    ) -> Result<TokenStatistics, StorageError> {
        let mut map = self.load_map()?;

        let baseline = match options.baseline {
            Some(baseline) => baseline,
            None => {
                let current = map.get(session_id).cloned().unwrap_or_default();
                LedgerBaseline {
                    initial_accumulated_cost: current.accumulated_cost,
                    initial_output_tokens: current.output_tokens,
                }
            }
        };

        let turn = calculate_token_statistics_from_messages(messages, options.system_prompt);
        let errored = options.outcome == TurnOutcome::Errored;

        let turn_output_tokens = if errored {
            0
        } else {
            turn.output_tokens_in_last_api_call
        };
        let turn_cost = match rate_card {
            Some(card) if !errored => {
                calculate_cost(
                    turn.input_tokens_in_last_api_call,
                    turn_output_tokens,
                    Some(card),
                )
                .total_cost
            }
            _ => 0.0,
        };

        let statistics = TokenStatistics {
            output_tokens: baseline.initial_output_tokens + turn_output_tokens,
            accumulated_cost: (baseline.initial_accumulated_cost + turn_cost).max(0.0),
            output_tokens_in_last_api_call: turn_output_tokens,
            last_api_call_cost: turn_cost,
            is_calculated: true,
            ..turn
        };

        map.insert(session_id.to_string(), statistics.clone());
        self.save_map(&map)?;

        tracing::debug!(
            session_id,
            outcome = ?options.outcome,
            turn_cost,
            accumulated_cost = statistics.accumulated_cost,
            output_tokens = statistics.output_tokens,
            input_tokens = statistics.input_tokens_in_last_api_call,
            "📊 Token statistics updated"
        );

        Ok(statistics)
    }

    /// セッションの統計を削除（会話クリア時）
    pub fn remove_statistics(&self, session_id: &str) -> Result<(), StorageError> {
        let mut map = self.load_map()?;
        if map.remove(session_id).is_some() {
            self.save_map(&map)?;
        }
        Ok(())
    }

    fn load_map(&self) -> Result<StatisticsMap, StorageError> {
        match self.storage.get(TOKEN_STATISTICS_KEY)? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(StatisticsMap::new()),
        }
    }

    fn save_map(&self, map: &StatisticsMap) -> Result<(), StorageError> {
        self.storage
            .set(TOKEN_STATISTICS_KEY, serde_json::to_value(map)?)
    }
}
