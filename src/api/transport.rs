//! 特権コーディネーターへのリクエスト送信
//!
//! 1リクエストにつき1つの応答を返す。チャネル未確立・切断時のみ指数バックオフで再試行する。
//! コーディネーター自体が消滅した（コンテキスト無効化）場合はエラーにせず空レスポンスを返す。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::protocol::{TransportRequest, TransportResponse};

/// Transportエラー
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request is missing the required 'action' field")]
    MissingAction,

    /// リトライを使い切った通信失敗
    #[error("Communication failed after {attempts} attempts: {message}")]
    PortClosed { attempts: u32, message: String },

    #[error("Request failed: {message}")]
    Failed { message: String },

    /// コーディネーターが `success: false` を返した
    #[error("Backend rejected the request: {message}")]
    Rejected { message: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransportError {
    pub fn is_port_closed(&self) -> bool {
        matches!(self, Self::PortClosed { .. })
    }
}

/// チャネル1回分の送信失敗
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// ポートが閉じている・未確立（再試行対象）
    #[error("Port closed: {0}")]
    PortClosed(String),

    /// 送信元コンテキストが無効化された（回復不能、黙って終了）
    #[error("Extension context invalidated")]
    ContextInvalidated,

    #[error("{0}")]
    Other(String),
}

/// コーディネーターへの生チャネル（1回の送信のみ）
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn post(&self, request: &TransportRequest) -> Result<serde_json::Value, ChannelError>;
}

#[async_trait]
impl<T: MessageChannel + ?Sized> MessageChannel for Arc<T> {
    async fn post(&self, request: &TransportRequest) -> Result<serde_json::Value, ChannelError> {
        (**self).post(request).await
    }
}

/// リトライ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 初回リトライまでの待機時間（ミリ秒）
    pub initial_delay_ms: u64,
    /// 最大リトライ回数（初回送信を含まない）
    pub max_retries: u32,
    /// 指数バックオフの倍率
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 250,
            max_retries: 2,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// n回目（1始まり）のリトライ前の待機時間
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let delay_ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(delay_ms.round() as u64)
    }
}

/// リトライ付きTransport
#[derive(Debug)]
pub struct Transport<C> {
    channel: C,
    retry_config: RetryConfig,
}

impl<C: MessageChannel> Transport<C> {
    pub fn new(channel: C) -> Self {
        Self::with_retry_config(channel, RetryConfig::default())
    }

    pub fn with_retry_config(channel: C, retry_config: RetryConfig) -> Self {
        Self {
            channel,
            retry_config,
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry_config
    }

    /// リクエストを送信して応答を待つ
    pub async fn send(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        request.validate()?;

        let max_attempts = self.retry_config.max_retries + 1;
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.channel.post(&request).await {
                Ok(value) => return Ok(TransportResponse(value)),
                Err(ChannelError::ContextInvalidated) => {
                    tracing::debug!(
                        action = %request.action,
                        "Context invalidated, resolving with empty response"
                    );
                    return Ok(TransportResponse::empty());
                }
                Err(ChannelError::PortClosed(message)) => {
                    if attempts >= max_attempts {
                        tracing::error!(
                            action = %request.action,
                            attempts,
                            "❌ Giving up after repeated port failures: {}",
                            message
                        );
                        return Err(TransportError::PortClosed { attempts, message });
                    }

                    let delay = self.retry_config.delay_for_retry(attempts);
                    tracing::warn!(
                        action = %request.action,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "🔁 Port closed, retrying: {}",
                        message
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(ChannelError::Other(message)) => {
                    tracing::error!(action = %request.action, "❌ Request failed: {}", message);
                    return Err(TransportError::Failed {
                        message: format!("'{}' failed: {}", request.action, message),
                    });
                }
            }
        }
    }
}
