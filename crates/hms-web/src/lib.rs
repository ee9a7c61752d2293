//! # HMS Web
//!
//! HTTP 接口层：REST API、认证鉴权、接口缓存、支付回调和 WebSocket 实时推送。

pub mod auth;
pub mod cache;
pub mod error;
pub mod handlers;
pub mod realtime;
pub mod server;
pub mod state;

pub use auth::{bootstrap_admin, AuthService, Claims, CurrentUser};
pub use cache::ResponseCache;
pub use error::{ApiError, ApiJson, ApiResult};
pub use server::{build_router, WebServer};
pub use state::AppState;
