use serde::{Deserialize, Serialize};

use super::statistics::{calculate_token_statistics_from_messages, TokenStatistics};
use crate::chat::models::ChatMessage;

/// コンテキストウィンドウの警告レベル
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    /// 50%未満
    #[default]
    None,
    /// 50%以上75%未満
    Notice,
    /// 75%以上90%未満
    Warning,
    /// 90%以上
    Critical,
}

impl WarningLevel {
    pub fn from_percentage(percentage: f64) -> Self {
        if percentage >= 90.0 {
            WarningLevel::Critical
        } else if percentage >= 75.0 {
            WarningLevel::Warning
        } else if percentage >= 50.0 {
            WarningLevel::Notice
        } else {
            WarningLevel::None
        }
    }
}

/// コンテキストウィンドウ使用状況
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextStatus {
    pub tokens_used: u64,
    pub context_window: u64,
    pub tokens_remaining: u64,
    pub percentage: f64,
    pub warning_level: WarningLevel,
}

impl ContextStatus {
    /// 使用量とウィンドウサイズから状況を計算
    pub fn from_usage(tokens_used: u64, context_window: Option<u64>) -> Self {
        let Some(window) = context_window.filter(|w| *w > 0) else {
            return Self::default();
        };

        let percentage = tokens_used as f64 / window as f64 * 100.0;
        Self {
            tokens_used,
            context_window: window,
            tokens_remaining: window.saturating_sub(tokens_used),
            percentage,
            warning_level: WarningLevel::from_percentage(percentage),
        }
    }

    pub fn is_exceeded(&self) -> bool {
        self.context_window > 0 && self.tokens_used > self.context_window
    }
}

/// 直近の入力トークン数をもとにコンテキスト使用状況を計算
pub fn calculate_context_status(
    statistics: &TokenStatistics,
    context_window: Option<u64>,
) -> ContextStatus {
    ContextStatus::from_usage(statistics.input_tokens_in_last_api_call, context_window)
}

/// これから送るプロンプトを含めた場合の使用状況を見積もる
pub fn project_context_status(
    messages: &[ChatMessage],
    pending_prompt: &str,
    system_prompt: Option<&str>,
    context_window: Option<u64>,
) -> ContextStatus {
    let mut projected = messages.to_vec();
    projected.push(ChatMessage::user(pending_prompt, None));
    let statistics = calculate_token_statistics_from_messages(&projected, system_prompt);
    calculate_context_status(&statistics, context_window)
}
