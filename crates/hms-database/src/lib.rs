//! # HMS数据库模块
//!
//! 负责患者、就诊、处方、检验与账单数据的存储，提供 SQLite 连接池和完整的 CRUD 操作。
//! 涉及多张表的业务动作（入账、发药、检验结果回写）都在单个事务内完成，
//! 并在同一事务中推进就诊流程。

pub mod billing;
pub mod connection;
pub mod lab;
pub mod models;
pub mod pharmacy;
pub mod queries;
pub mod visits;

// 重新导出主要类型
pub use billing::{PaymentReceipt, WebhookOutcome};
pub use connection::{DatabasePool, PoolSettings};
pub use lab::LabUpdate;
pub use models::*;
pub use pharmacy::DispenseReceipt;
pub use queries::DatabaseQueries;
pub use visits::{engine, VisitTransition};
