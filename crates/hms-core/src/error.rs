//! 错误定义模块

use thiserror::Error;

/// HMS系统统一错误类型
#[derive(Error, Debug)]
pub enum HmsError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("未认证: {0}")]
    Unauthorized(String),

    #[error("权限错误: {0}")]
    Forbidden(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("冲突: {0}")]
    Conflict(String),

    #[error("无效状态转换: 从 {from} 到 {event}")]
    InvalidStateTransition { from: String, event: String },

    #[error("支付网关错误: {0}")]
    Gateway(String),

    #[error("网络错误: {0}")]
    Network(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

impl HmsError {
    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{} {} not found", entity, id))
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for HmsError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => HmsError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                HmsError::Conflict(format!("duplicate record: {}", db_err.message()))
            }
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                HmsError::Validation(format!("referenced record does not exist: {}", db_err.message()))
            }
            other => HmsError::Database(other.to_string()),
        }
    }
}

/// HMS系统统一结果类型
pub type Result<T> = std::result::Result<T, HmsError>;
