//! クレート全体のエラー型
//!
//! 各レイヤー（Transport / Storage）のエラーを束ねる。

use thiserror::Error;

use crate::api::TransportError;
use crate::database::StorageError;

/// tabchat のトップレベルエラー
#[derive(Error, Debug)]
pub enum TabchatError {
    /// バックエンドとの通信エラー
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// 永続化エラー
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// 入力検証エラー（部分的な状態変更は行わない）
    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    /// プラットフォーム・モデル・認証情報の未設定
    #[error("Chat is not configured: missing {missing}")]
    NotConfigured { missing: String },

    /// ストリーミング中（またはキャンセル処理中）の操作
    #[error("A response is still streaming")]
    StreamBusy,

    /// 設定ファイルの読み書きエラー
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),
}

impl TabchatError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn not_configured(missing: impl Into<String>) -> Self {
        Self::NotConfigured {
            missing: missing.into(),
        }
    }

    /// リトライを使い切ったポート切断エラーかどうか
    pub fn is_port_closed(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_port_closed())
    }
}

pub type TabchatResult<T> = Result<T, TabchatError>;
