//! 日志初始化

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// 按配置安装全局日志订阅器
///
/// `RUST_LOG` 存在时优先于配置中的级别。重复调用返回错误。
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(&config.level)?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match config.format.as_str() {
        "json" => builder
            .json()
            .with_current_span(false)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install json logger: {}", e))?,
        _ => builder
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install logger: {}", e))?,
    }

    tracing::debug!("Logging initialised at '{}' ({})", config.level, config.format);
    Ok(())
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("invalid log level '{}'", level)),
    }
}
