//! # HMS管理模块
//!
//! 提供配置管理、日志初始化和业务指标等运维功能。

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::{ConfigManager, ConfigValidator, HmsConfig};
pub use logging::init_logging;
pub use metrics::Metrics;
