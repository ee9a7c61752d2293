//! 配置管理
//!
//! 配置来源按优先级从低到高：内置默认值、配置文件（可选）、`HMS__` 前缀的环境变量，
//! 最后由命令行参数覆盖。例如 `HMS__SERVER__PORT=9000`、`HMS__AUTH__JWT_SECRET=...`。

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use hms_integration::{MobileMoneySettings, ZenoPaySettings};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info};

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    config: Arc<RwLock<HmsConfig>>,
    validator: ConfigValidator,
}

/// HMS系统完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HmsConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub cache: CacheConfig,
    pub payments: PaymentsConfig,
    pub realtime: RealtimeConfig,
    pub logging: LoggingConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// 请求超时（秒）
    pub request_timeout_secs: u64,
    /// CORS允许的源，`*` 表示任意
    pub cors_allowed_origins: Vec<String>,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite连接串，如 `sqlite://hms.db` 或 `sqlite::memory:`
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout_secs: u64,
    pub acquire_timeout_secs: u64,
}

/// 认证配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// JWT签名密钥，至少16字节
    pub jwt_secret: String,
    /// 令牌有效期（分钟）
    pub token_ttl_minutes: i64,
    /// 用户表为空时创建的初始管理员
    pub bootstrap_admin: BootstrapAdminConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapAdminConfig {
    pub username: String,
    pub password: String,
    pub email: String,
    pub full_name: String,
}

/// 接口缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub visits_ttl_secs: u64,
    pub appointments_ttl_secs: u64,
    pub max_entries: u64,
}

/// 支付配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentsConfig {
    /// 测试模式，所有渠道走模拟网关
    pub simulate: bool,
    pub zenopay: ZenoPaySettings,
    pub mobile_money: MobileMoneySettings,
}

/// 实时推送配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub channel_capacity: usize,
    /// 外部系统调用 `/api/socket/emit` 时携带的令牌，未配置则关闭该接口
    pub emit_token: Option<String>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别或 EnvFilter 指令
    pub level: String,
    /// `pretty` 或 `json`
    pub format: String,
}

/// 配置验证器
#[derive(Debug)]
pub struct ConfigValidator {
    validation_rules: Vec<ValidationRule>,
}

/// 验证规则
#[derive(Debug)]
struct ValidationRule {
    field_path: &'static str,
    validator: fn(&HmsConfig) -> Result<()>,
}

impl ConfigManager {
    /// 加载配置，文件不存在时只用默认值和环境变量
    pub fn new(config_path: Option<&str>) -> Result<Self> {
        let config = Self::load_config(config_path)?;
        let validator = ConfigValidator::new();

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            validator,
        })
    }

    /// 直接使用给定配置，用于测试和命令行覆盖之后
    pub fn from_config(config: HmsConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            validator: ConfigValidator::new(),
        }
    }

    fn load_config(config_path: Option<&str>) -> Result<HmsConfig> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("HMS")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.cors_allowed_origins"),
            )
            .build()
            .context("Failed to read configuration sources")?;

        let config: HmsConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        info!("Configuration loaded from {}", config_path.unwrap_or("defaults and environment"));
        Ok(config)
    }

    pub async fn get_config(&self) -> HmsConfig {
        self.config.read().await.clone()
    }

    /// 修改配置，新配置必须通过验证
    pub async fn update_config<F>(&self, update: F) -> Result<HmsConfig>
    where
        F: FnOnce(&mut HmsConfig),
    {
        let mut config = self.config.write().await;
        let mut candidate = config.clone();
        update(&mut candidate);
        self.validator.validate(&candidate)?;
        *config = candidate.clone();
        Ok(candidate)
    }

    pub async fn validate_config(&self) -> Result<()> {
        let config = self.config.read().await;
        self.validator.validate(&config)
    }
}

impl ConfigValidator {
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "server.port",
                validator: |config| {
                    anyhow::ensure!(config.server.port != 0, "server port cannot be 0");
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "database.max_connections",
                validator: |config| {
                    anyhow::ensure!(config.database.max_connections > 0, "pool size cannot be 0");
                    anyhow::ensure!(!config.database.url.trim().is_empty(), "database url is required");
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "auth.jwt_secret",
                validator: |config| {
                    anyhow::ensure!(
                        config.auth.jwt_secret.len() >= 16,
                        "jwt secret must be at least 16 bytes"
                    );
                    anyhow::ensure!(config.auth.token_ttl_minutes > 0, "token ttl must be positive");
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "payments.zenopay",
                validator: |config| {
                    let zenopay = &config.payments.zenopay;
                    if zenopay.enabled && !config.payments.simulate {
                        anyhow::ensure!(!zenopay.api_key.trim().is_empty(), "zenopay api key is required");
                        anyhow::ensure!(!zenopay.base_url.trim().is_empty(), "zenopay base url is required");
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "payments.mobile_money",
                validator: |config| {
                    let mobile = &config.payments.mobile_money;
                    if mobile.enabled && !config.payments.simulate {
                        anyhow::ensure!(!mobile.endpoint.trim().is_empty(), "mobile money endpoint is required");
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "cache",
                validator: |config| {
                    if config.cache.enabled {
                        anyhow::ensure!(
                            config.cache.visits_ttl_secs > 0 && config.cache.appointments_ttl_secs > 0,
                            "cache ttl must be positive"
                        );
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "logging.format",
                validator: |config| {
                    anyhow::ensure!(
                        matches!(config.logging.format.as_str(), "pretty" | "json"),
                        "log format must be 'pretty' or 'json'"
                    );
                    Ok(())
                },
            },
        ];

        Self { validation_rules }
    }

    pub fn validate(&self, config: &HmsConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("Configuration validation failed for {}: {}", rule.field_path, e);
                return Err(e.context(format!("invalid configuration at {}", rule.field_path)));
            }
        }
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "HMS-Server".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            cors_allowed_origins: vec!["*".to_string()],
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://hms.db".to_string(),
            max_connections: 8,
            busy_timeout_secs: 5,
            acquire_timeout_secs: 10,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl_minutes: 8 * 60,
            bootstrap_admin: BootstrapAdminConfig::default(),
        }
    }
}

impl Default for BootstrapAdminConfig {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: String::new(),
            email: "admin@hms.local".to_string(),
            full_name: "System Administrator".to_string(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            visits_ttl_secs: 30,
            appointments_ttl_secs: 60,
            max_entries: 10_000,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            emit_token: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> HmsConfig {
        let mut config = HmsConfig::default();
        config.auth.jwt_secret = "0123456789abcdef-secret".to_string();
        config
    }

    #[test]
    fn test_defaults_need_a_secret() {
        let validator = ConfigValidator::new();
        assert!(validator.validate(&HmsConfig::default()).is_err());
        assert!(validator.validate(&valid()).is_ok());
    }

    #[test]
    fn test_validation_rules() {
        let validator = ConfigValidator::new();

        let mut config = valid();
        config.server.port = 0;
        assert!(validator.validate(&config).is_err());

        let mut config = valid();
        config.database.max_connections = 0;
        assert!(validator.validate(&config).is_err());

        let mut config = valid();
        config.payments.zenopay.enabled = true;
        assert!(validator.validate(&config).is_err());
        config.payments.simulate = true;
        assert!(validator.validate(&config).is_ok());

        let mut config = valid();
        config.cache.visits_ttl_secs = 0;
        assert!(validator.validate(&config).is_err());
        config.cache.enabled = false;
        assert!(validator.validate(&config).is_ok());

        let mut config = valid();
        config.logging.format = "xml".to_string();
        assert!(validator.validate(&config).is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let manager = ConfigManager::new(Some("/nonexistent/hms-config")).unwrap();
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let config = runtime.block_on(manager.get_config());
        assert_eq!(config.database.max_connections, 8);
        assert_eq!(config.cache.appointments_ttl_secs, 60);
    }

    #[tokio::test]
    async fn test_update_is_validated() {
        let manager = ConfigManager::from_config(valid());
        assert!(manager.update_config(|c| c.server.port = 0).await.is_err());
        assert_eq!(manager.get_config().await.server.port, 8080);

        let updated = manager.update_config(|c| c.server.port = 9090).await.unwrap();
        assert_eq!(updated.server.port, 9090);
        assert!(manager.validate_config().await.is_ok());
    }
}
