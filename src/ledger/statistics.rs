//! セッション単位のトークン統計
//!
//! `output_tokens` と `accumulated_cost` はセッション全体の累積値。
//! `*_in_last_api_call` は直近1ターン分の内訳で、毎ターン再計算する（加算しない）。

use serde::{Deserialize, Serialize};

use super::tokenizer::{estimate_optional_tokens, estimate_tokens};
use crate::chat::models::ChatMessage;

/// トークン統計
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenStatistics {
    /// 累積出力トークン数
    pub output_tokens: u64,
    /// 累積料金
    pub accumulated_cost: f64,
    pub prompt_tokens_in_last_api_call: u64,
    pub history_tokens_sent_in_last_api_call: u64,
    pub system_tokens_in_last_api_call: u64,
    pub input_tokens_in_last_api_call: u64,
    pub output_tokens_in_last_api_call: u64,
    pub last_api_call_cost: f64,
    pub is_calculated: bool,
}

/// ユーザーメッセージのトークン数（保存値がなければ推定）
pub fn user_message_tokens(message: &ChatMessage) -> u64 {
    match message {
        ChatMessage::User(m) => m
            .input_tokens
            .unwrap_or_else(|| estimate_tokens(&m.content)),
        _ => 0,
    }
}

/// アシスタントメッセージのトークン数（本文＋思考）
pub fn assistant_message_tokens(message: &ChatMessage) -> u64 {
    match message {
        ChatMessage::Assistant(m) => m.output_tokens.unwrap_or_else(|| {
            estimate_tokens(&m.content) + estimate_optional_tokens(m.thinking_content.as_deref())
        }),
        _ => 0,
    }
}

/// メッセージ列からトークン統計を計算（料金・累積料金は含まない）
///
/// 最後のユーザーメッセージがプロンプト、それ以外のユーザー/アシスタントが履歴。
/// システムプロンプトは履歴に含めず `system_tokens_in_last_api_call` にだけ数える。
pub fn calculate_token_statistics_from_messages(
    messages: &[ChatMessage],
    system_prompt: Option<&str>,
) -> TokenStatistics {
    let last_user_index = messages
        .iter()
        .rposition(|m| matches!(m, ChatMessage::User(_)));
    let last_assistant_index = messages
        .iter()
        .rposition(|m| matches!(m, ChatMessage::Assistant(_)));

    let mut prompt_tokens = 0;
    let mut history_tokens = 0;
    let mut output_tokens = 0;
    let mut last_output_tokens = 0;

    for (index, message) in messages.iter().enumerate() {
        match message {
            ChatMessage::User(_) => {
                let tokens = user_message_tokens(message);
                if Some(index) == last_user_index {
                    prompt_tokens = tokens;
                } else {
                    history_tokens += tokens;
                }
            }
            ChatMessage::Assistant(_) => {
                let tokens = assistant_message_tokens(message);
                output_tokens += tokens;
                history_tokens += tokens;
                if Some(index) == last_assistant_index {
                    last_output_tokens = tokens;
                }
            }
            ChatMessage::System(_) => {}
        }
    }

    let system_tokens = estimate_optional_tokens(system_prompt);

    TokenStatistics {
        output_tokens,
        accumulated_cost: 0.0,
        prompt_tokens_in_last_api_call: prompt_tokens,
        history_tokens_sent_in_last_api_call: history_tokens,
        system_tokens_in_last_api_call: system_tokens,
        input_tokens_in_last_api_call: system_tokens + history_tokens + prompt_tokens,
        output_tokens_in_last_api_call: last_output_tokens,
        last_api_call_cost: 0.0,
        is_calculated: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::models::{AssistantMessage, ChatMessage};
    use chrono::Utc;

    fn assistant(content: &str, output_tokens: Option<u64>) -> ChatMessage {
        ChatMessage::Assistant(AssistantMessage {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.to_string(),
            thinking_content: None,
            timestamp: Utc::now(),
            output_tokens,
            api_cost: None,
            is_streaming: false,
            platform_id: None,
            model_id: None,
        })
    }

    #[test]
    fn test_last_user_is_prompt_and_rest_is_history() {
        let messages = vec![
            ChatMessage::user("first", Some(3)),
            assistant("reply one", Some(5)),
            ChatMessage::user("second", Some(7)),
            assistant("reply two", Some(11)),
        ];

        let stats = calculate_token_statistics_from_messages(&messages, None);

        assert_eq!(stats.prompt_tokens_in_last_api_call, 7);
        assert_eq!(stats.history_tokens_sent_in_last_api_call, 3 + 5 + 11);
        assert_eq!(stats.system_tokens_in_last_api_call, 0);
        assert_eq!(stats.input_tokens_in_last_api_call, 3 + 5 + 11 + 7);
        assert_eq!(stats.output_tokens_in_last_api_call, 11);
        assert_eq!(stats.output_tokens, 16);
        assert!(stats.is_calculated);
    }

    #[test]
    fn test_system_prompt_is_not_history() {
        let messages = vec![ChatMessage::user("Hi", Some(2))];
        let system_prompt = "You are a helpful assistant.";

        let stats = calculate_token_statistics_from_messages(&messages, Some(system_prompt));

        let system_tokens = estimate_tokens(system_prompt);
        assert!(system_tokens > 0);
        assert_eq!(stats.system_tokens_in_last_api_call, system_tokens);
        assert_eq!(stats.history_tokens_sent_in_last_api_call, 0);
        assert_eq!(stats.input_tokens_in_last_api_call, system_tokens + 2);
    }

    #[test]
    fn test_output_tokens_is_sum_over_all_assistants() {
        let messages = vec![
            assistant("a", Some(4)),
            ChatMessage::system("Error: boom"),
            assistant("b", None),
            assistant("c", Some(6)),
        ];

        let stats = calculate_token_statistics_from_messages(&messages, None);
        let expected: u64 = messages.iter().map(assistant_message_tokens).sum();

        assert_eq!(stats.output_tokens, expected);
        assert_eq!(stats.output_tokens, 4 + estimate_tokens("b") + 6);
        assert_eq!(stats.output_tokens_in_last_api_call, 6);
    }

    #[test]
    fn test_empty_messages() {
        let stats = calculate_token_statistics_from_messages(&[], None);
        assert_eq!(stats.input_tokens_in_last_api_call, 0);
        assert_eq!(stats.output_tokens, 0);
    }
}
