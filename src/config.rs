//! アプリケーション設定管理モジュール
//!
//! XDGディレクトリ上の `config.toml` を読み書きする。
//! 各セクションは `#[serde(default)]` なので、一部だけ書かれたファイルも読める。

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::api::RetryConfig;
use crate::ledger::RateCard;

/// キャンセル時に表示テキストへ付けるマーカー
pub const DEFAULT_CANCEL_MARKER: &str = "[Stream cancelled by user]";

/// ストリーミング設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// フラッシュ間隔（ミリ秒）。1ティックにつき最大1回だけ表示を更新する
    pub flush_interval_ms: u64,
    pub cancel_marker: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 16,
            cancel_marker: DEFAULT_CANCEL_MARKER.to_string(),
        }
    }
}

/// 永続化設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLiteファイル（Noneの場合はXDGデフォルト）
    pub database_path: Option<PathBuf>,
    /// 書き込み容量の上限（バイト）
    pub quota_bytes: Option<u64>,
    /// ファイルを使わずプロセス内に保持する
    pub in_memory: bool,
}

/// ログ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// カスタムログディレクトリ（Noneの場合はXDGデフォルト使用）
    pub log_dir: Option<PathBuf>,
    /// ログレベル (trace/debug/info/warn/error)
    pub log_level: String,
    /// ファイル出力有効化
    pub enable_file_logging: bool,
    pub log_file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            log_level: "info".to_string(),
            enable_file_logging: false,
            log_file_prefix: "tabchat.log".to_string(),
        }
    }
}

/// モデルごとのプロファイル
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub platform_id: String,
    pub model_id: String,
    #[serde(default)]
    pub context_window: Option<u64>,
    #[serde(default)]
    pub pricing: Option<RateCard>,
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub transport: RetryConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub models: Vec<ModelProfile>,
}

impl AppConfig {
    pub fn find_model(&self, platform_id: &str, model_id: &str) -> Option<&ModelProfile> {
        self.models
            .iter()
            .find(|m| m.platform_id == platform_id && m.model_id == model_id)
    }
}

/// 設定管理マネージャー
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// XDG設定ディレクトリを使うマネージャーを作成
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        Ok(Self { config_path })
    }

    /// 任意のパスを使う（テスト・組み込み用）
    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    fn get_config_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("dev", "tabchat", "tabchat")
            .context("Failed to get project directories")?;

        let config_file = project_dirs.config_dir().join("config.toml");
        debug!("Config file path: {}", config_file.display());

        Ok(config_file)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// 設定を読み込み（ファイルが無ければデフォルト）
    pub fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!(
                "Config file not found, using default settings: {}",
                self.config_path.display()
            );
            return Ok(AppConfig::default());
        }

        let config_content = fs::read_to_string(&self.config_path).with_context(|| {
            format!("Failed to read config file: {}", self.config_path.display())
        })?;

        let config: AppConfig = toml::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse config file: {}",
                self.config_path.display()
            )
        })?;

        info!(
            models = config.models.len(),
            "✅ Configuration loaded from: {}",
            self.config_path.display()
        );

        Ok(config)
    }

    /// 設定を保存
    pub fn save_config(&self, config: &AppConfig) -> Result<()> {
        let config_content =
            toml::to_string_pretty(config).context("Failed to serialize config")?;

        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(&self.config_path, config_content).with_context(|| {
            format!(
                "Failed to write config file: {}",
                self.config_path.display()
            )
        })?;

        info!("💾 Configuration saved to: {}", self.config_path.display());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_config() -> AppConfig {
        AppConfig {
            models: vec![ModelProfile {
                platform_id: "openai".to_string(),
                model_id: "gpt-4o".to_string(),
                context_window: Some(128_000),
                pricing: Some(RateCard::new(2.5, 10.0)),
            }],
            ..AppConfig::default()
        }
    }

    #[test]
    fn test_config_manager_save_load() {
        let temp_dir = tempdir().unwrap();
        let manager = ConfigManager::with_path(temp_dir.path().join("config.toml"));
        let original = sample_config();

        manager.save_config(&original).unwrap();
        let loaded = manager.load_config().unwrap();

        assert_eq!(loaded, original);
        let profile = loaded.find_model("openai", "gpt-4o").unwrap();
        assert_eq!(profile.context_window, Some(128_000));
        assert!(loaded.find_model("openai", "unknown").is_none());
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let temp_dir = tempdir().unwrap();
        let manager = ConfigManager::with_path(temp_dir.path().join("nonexistent.toml"));

        let loaded = manager.load_config().unwrap();

        assert_eq!(loaded, AppConfig::default());
        assert_eq!(loaded.transport.initial_delay_ms, 250);
        assert_eq!(loaded.transport.max_retries, 2);
        assert_eq!(loaded.stream.flush_interval_ms, 16);
        assert_eq!(loaded.stream.cancel_marker, DEFAULT_CANCEL_MARKER);
    }

    #[test]
    fn test_partial_file_uses_section_defaults() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("partial.toml");
        std::fs::write(
            &config_path,
            "[stream]\nflush_interval_ms = 50\n\n[transport]\nmax_retries = 5\n",
        )
        .unwrap();

        let loaded = ConfigManager::with_path(config_path).load_config().unwrap();

        assert_eq!(loaded.stream.flush_interval_ms, 50);
        assert_eq!(loaded.stream.cancel_marker, DEFAULT_CANCEL_MARKER);
        assert_eq!(loaded.transport.max_retries, 5);
        assert_eq!(loaded.transport.initial_delay_ms, 250);
        assert!(loaded.models.is_empty());
    }

    #[test]
    fn test_config_load_corrupted_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("corrupted.toml");
        std::fs::write(&config_path, "invalid toml content [unclosed section").unwrap();

        let result = ConfigManager::with_path(config_path).load_config();

        assert!(result.is_err());
    }
}
