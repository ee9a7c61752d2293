//! HMS服务器主程序

use anyhow::{Context, Result};
use clap::Parser;
use hms_admin::{init_logging, ConfigManager, HmsConfig};
use hms_database::{DatabasePool, DatabaseQueries, PoolSettings};
use hms_web::{bootstrap_admin, AppState, WebServer};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info, warn};

/// HMS服务器命令行参数
#[derive(Parser, Debug)]
#[command(name = "hms-server")]
#[command(about = "医院管理系统（HMS）后端服务")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 监听端口，覆盖配置
    #[arg(short, long)]
    port: Option<u16>,

    /// 数据库连接串，覆盖配置
    #[arg(short, long)]
    database_url: Option<String>,

    /// 日志级别，覆盖配置
    #[arg(short, long)]
    log_level: Option<String>,
}

fn pool_settings(config: &HmsConfig) -> PoolSettings {
    PoolSettings {
        url: config.database.url.clone(),
        max_connections: config.database.max_connections,
        busy_timeout: Duration::from_secs(config.database.busy_timeout_secs),
        acquire_timeout: Duration::from_secs(config.database.acquire_timeout_secs),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let manager = ConfigManager::new(args.config.as_deref())?;
    let config = manager
        .update_config(|config| {
            if let Some(port) = args.port {
                config.server.port = port;
            }
            if let Some(url) = &args.database_url {
                config.database.url = url.clone();
            }
            if let Some(level) = &args.log_level {
                config.logging.level = level.clone();
            }
        })
        .await?;

    init_logging(&config.logging)?;
    info!("启动HMS服务器 {}...", config.server.name);
    info!("  监听地址: {}", config.server.bind_address());
    info!("  数据库: {}", config.database.url);
    if config.payments.simulate {
        warn!("Payment gateways are simulated; no real money will move");
    }

    let addr: SocketAddr = config
        .server
        .bind_address()
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind_address()))?;

    let db = DatabasePool::new(&pool_settings(&config)).await?;
    DatabaseQueries::new(&db).create_tables().await?;

    let state = AppState::new(config, db.clone())?;
    bootstrap_admin(&state.queries(), &state.auth, &state.config.auth.bootstrap_admin).await?;

    let server = WebServer::new(addr, state);
    if let Err(e) = server.run().await {
        error!("服务器运行失败: {}", e);
        db.close().await;
        return Err(e.into());
    }

    db.close().await;
    info!("HMS服务器已停止");
    Ok(())
}
