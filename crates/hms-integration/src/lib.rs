//! # HMS集成模块
//!
//! 提供与外部系统的集成功能，包括：
//! - 移动支付网关连接器（ZenoPay、通用移动钱包、测试模式模拟网关）
//! - 支付回调签名校验与报文解析
//! - 手机号规范化
//! - 实时通知中转，向浏览器推送业务事件

pub mod connectors;
pub mod phone;
pub mod realtime;
pub mod webhook;

pub use connectors::{
    GatewayRegistry, GatewayResponse, GatewayStatus, MobileMoneyGateway, MobileMoneySettings, PaymentGateway,
    PaymentRequest, SimulatedGateway, ZenoPayGateway, ZenoPaySettings,
};
pub use phone::normalize_phone;
pub use realtime::{Notification, NotificationHub, RoomSet, BROADCAST_ROOM};
pub use webhook::{parse_notice, sign_payload, verify_signature, WebhookNotice, SIGNATURE_HEADER};
