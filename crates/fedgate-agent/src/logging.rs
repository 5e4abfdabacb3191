//! 日志初始化

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

/// 初始化全局日志订阅者
///
/// 设置了 `RUST_LOG` 时以环境变量为准，否则使用配置中的日志级别。
pub fn init_logging(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("无效的日志级别: {}", level))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("初始化日志失败: {}", e))
}
