//! ログ初期化

use anyhow::Context;
use directories::ProjectDirs;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;

/// tracingサブスクライバーを初期化
///
/// `RUST_LOG` が設定されていればそちらを優先する。ファイル出力を有効にした場合は
/// 返された `WorkerGuard` を保持し続けること（ドロップでバッファが捨てられる）。
pub fn init_logging(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Invalid log level")?;

    let console_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    if !config.enable_file_logging {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init()?;
        return Ok(None);
    }

    let log_dir = resolve_log_dir(config)?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let appender = tracing_appender::rolling::daily(&log_dir, &config.log_file_prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()?;

    tracing::info!("📝 File logging enabled: {}", log_dir.display());
    Ok(Some(guard))
}

fn resolve_log_dir(config: &LogConfig) -> anyhow::Result<PathBuf> {
    if let Some(dir) = &config.log_dir {
        return Ok(dir.clone());
    }
    let project_dirs = ProjectDirs::from("dev", "tabchat", "tabchat")
        .context("Failed to get project directories")?;
    Ok(project_dirs.data_local_dir().join("logs"))
}
