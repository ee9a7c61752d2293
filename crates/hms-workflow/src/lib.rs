//! # HMS工作流模块
//!
//! 提供医院业务流程的规则层，包括：
//! - 就诊状态机：管理一次就诊在各科室之间的阶段流转
//! - 预约生命周期
//! - 账单规则：发票状态推导与付款校验
//! - 药房与检验规则
//! - 科室工作队列

pub mod appointment;
pub mod billing;
pub mod engine;
pub mod lab;
pub mod pharmacy;
pub mod state_machine;
pub mod worklist;

// 重新导出主要类型
pub use appointment::{AppointmentEvent, AppointmentStateMachine};
pub use billing::InvoiceBalance;
pub use engine::{stage_room, TransitionPlan, WorkflowEffect, WorkflowEngine};
pub use state_machine::{check_consistency, VisitEvent, VisitStateMachine};
pub use worklist::{QueueEntry, QueueStats, StageQueue};
