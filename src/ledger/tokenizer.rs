//! トークン数推定
//!
//! cl100k_base のBPEで数える。トークナイザーを構築できない環境では
//! 文字数/4 の切り上げにフォールバックし、決してパニックしない。

use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

static TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn tokenizer() -> Option<&'static CoreBPE> {
    TOKENIZER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                tracing::warn!("Tokenizer unavailable, using length heuristic: {}", e);
                None
            }
        })
        .as_ref()
}

/// 文字数ベースの推定（ceil(len / 4)）
pub fn heuristic_token_count(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// テキストのトークン数を推定
///
/// 空・空白のみのテキストは0。それ以外は必ず1以上。
pub fn estimate_tokens(text: &str) -> u64 {
    if text.trim().is_empty() {
        return 0;
    }

    let count = match tokenizer() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
        None => heuristic_token_count(text),
    };

    if count == 0 {
        heuristic_token_count(text).max(1)
    } else {
        count
    }
}

/// 省略可能なテキストのトークン数（Noneは0）
pub fn estimate_optional_tokens(text: Option<&str>) -> u64 {
    text.map(estimate_tokens).unwrap_or(0)
}
