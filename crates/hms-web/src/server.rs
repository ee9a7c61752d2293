//! Web服务器

use crate::auth::{auth_middleware, get_current_user, login_handler};
use crate::handlers::{admin, api_root, billing, clinical, health, metrics, patients, visits};
use crate::realtime;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use hms_core::{HmsError, Result};
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

pub struct WebServer {
    addr: SocketAddr,
    app: Router,
}

impl WebServer {
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self {
            addr,
            app: build_router(state),
        }
    }

    pub async fn run(self) -> Result<()> {
        info!("Starting web server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| HmsError::Internal(format!("failed to bind {}: {}", self.addr, e)))?;
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| HmsError::Internal(format!("web server stopped: {}", e)))?;

        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, draining connections");
}

/// 构建完整路由
pub fn build_router(state: AppState) -> Router {
    let server = &state.config.server;
    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&server.cors_allowed_origins))
        .layer(TimeoutLayer::new(server.request_timeout()));

    Router::new()
        .route("/", get(api_root))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/ws", get(realtime::ws_upgrade))
        .route("/api/socket/emit", post(realtime::emit))
        .nest("/api/v1", public_routes().merge(protected_routes(state.clone())))
        .layer(middleware::from_fn_with_state(state.clone(), track_metrics))
        .layer(middleware_stack)
        .with_state(state)
}

/// 无需令牌的接口：登录和支付回调
fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login_handler))
        .route("/webhooks/zenopay", post(billing::zenopay_webhook))
        .route("/webhooks/mobile-money/:provider", post(billing::mobile_money_webhook))
}

/// API v1 路由，全部需要认证
fn protected_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/auth/me", get(get_current_user))
        // 患者
        .route("/patients", get(patients::list_patients).post(patients::create_patient))
        .route(
            "/patients/:id",
            get(patients::get_patient)
                .put(patients::update_patient)
                .delete(patients::delete_patient),
        )
        .route("/patients/:id/active-visit", get(patients::active_visit))
        // 就诊
        .route("/visits", get(visits::list_visits).post(visits::create_visit))
        .route("/visits/queue/:stage", get(visits::stage_queue))
        .route("/visits/:id", get(visits::get_visit))
        .route("/visits/:id/transition", post(visits::transition_visit))
        .route("/visits/:id/events", get(visits::visit_events))
        // 预约
        .route("/appointments", get(visits::list_appointments).post(visits::create_appointment))
        .route("/appointments/:id", get(visits::get_appointment).put(visits::update_appointment))
        .route("/appointments/:id/status", post(visits::update_appointment_status))
        .route("/appointments/:id/check-in", post(visits::check_in_appointment))
        // 科室与收费项目
        .route("/departments", get(admin::list_departments).post(admin::create_department))
        .route("/departments/:id", get(admin::get_department))
        .route("/services", get(admin::list_services).post(admin::create_service))
        .route("/services/:id", get(admin::get_service).put(admin::update_service))
        // 药房
        .route("/medications", get(clinical::list_medications).post(clinical::create_medication))
        .route("/medications/low-stock", get(clinical::low_stock_medications))
        .route("/medications/:id", get(clinical::get_medication))
        .route("/medications/:id/restock", post(clinical::restock_medication))
        .route("/prescriptions", get(clinical::list_prescriptions).post(clinical::create_prescription))
        .route("/prescriptions/:id", get(clinical::get_prescription))
        .route("/prescriptions/:id/cancel", post(clinical::cancel_prescription))
        .route("/prescriptions/:id/items/:item_id/dispense", post(clinical::dispense_item))
        // 检验
        .route("/lab-tests", get(clinical::list_lab_tests).post(clinical::order_lab_test))
        .route("/lab-tests/:id", get(clinical::get_lab_test))
        .route("/lab-tests/:id/start", post(clinical::start_lab_test))
        .route("/lab-tests/:id/results", post(clinical::record_lab_results))
        .route("/lab-tests/:id/cancel", post(clinical::cancel_lab_test))
        // 账单
        .route("/invoices", get(billing::list_invoices).post(billing::create_invoice))
        .route("/invoices/:id", get(billing::get_invoice))
        .route("/invoices/:id/items", post(billing::add_invoice_item))
        .route("/invoices/:id/cancel", post(billing::cancel_invoice))
        .route("/invoices/:id/payments", get(billing::list_payments).post(billing::apply_payment))
        .route("/payments/providers", get(billing::payment_providers))
        .route("/payments/mobile", post(billing::initiate_mobile_payment))
        .route("/payments/mobile/:reference", get(billing::get_mobile_payment))
        .route("/payments/mobile/:reference/refresh", post(billing::refresh_mobile_payment))
        .route("/payments/:id", get(billing::get_payment))
        .route("/payments/:id/void", post(billing::void_payment))
        // 用户与审计
        .route("/users", get(admin::list_users).post(admin::create_user))
        .route("/users/:id", get(admin::get_user).put(admin::update_user))
        .route("/activity-logs", get(admin::list_activity))
        .route_layer(middleware::from_fn_with_state(state, auth_middleware))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

/// HTTP请求计数
async fn track_metrics(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let response = next.run(request).await;
    state
        .metrics
        .record_http_request(method.as_str(), response.status().as_u16());
    response
}
