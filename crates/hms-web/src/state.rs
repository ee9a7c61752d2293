//! 应用共享状态

use crate::auth::AuthService;
use crate::cache::ResponseCache;
use hms_admin::{HmsConfig, Metrics};
use hms_core::{HmsError, Result};
use hms_database::{DatabasePool, DatabaseQueries, NewActivity, VisitTransition};
use hms_integration::{GatewayRegistry, NotificationHub};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// 所有处理器共享的状态
#[derive(Clone)]
pub struct AppState {
    pub db: DatabasePool,
    pub auth: Arc<AuthService>,
    pub cache: ResponseCache,
    pub hub: NotificationHub,
    pub gateways: Arc<GatewayRegistry>,
    pub metrics: Metrics,
    pub config: Arc<HmsConfig>,
}

impl AppState {
    pub fn new(config: HmsConfig, db: DatabasePool) -> Result<Self> {
        let metrics = Metrics::new().map_err(|e| HmsError::Internal(format!("metrics registry: {}", e)))?;
        let gateways = GatewayRegistry::from_settings(
            &config.payments.zenopay,
            &config.payments.mobile_money,
            config.payments.simulate,
        )?;

        Ok(Self {
            db,
            auth: Arc::new(AuthService::new(
                config.auth.jwt_secret.as_bytes(),
                config.auth.token_ttl_minutes,
            )),
            cache: ResponseCache::new(&config.cache, metrics.clone()),
            hub: NotificationHub::new(config.realtime.channel_capacity),
            gateways: Arc::new(gateways),
            metrics,
            config: Arc::new(config),
        })
    }

    pub fn queries(&self) -> DatabaseQueries<'_> {
        DatabaseQueries::new(&self.db)
    }

    /// 写审计日志；业务已提交，失败只记日志
    pub async fn audit(&self, user_id: Option<Uuid>, action: &str, entity_type: &str, entity_id: Option<Uuid>) {
        let activity = NewActivity::new(user_id, action, entity_type, entity_id);
        if let Err(e) = self.queries().log_activity(&activity).await {
            warn!("Failed to record activity {} on {}: {}", action, entity_type, e);
        }
    }

    /// 就诊状态变化后的统一收尾：失效缓存、计数、推送
    pub fn visit_transitioned(&self, transition: &VisitTransition) {
        self.cache.invalidate_workflow();
        self.metrics.record_visit_transition(transition.plan.event.name());
        self.hub.publish_to_rooms(
            "visit.transitioned",
            transition.plan.rooms(),
            json!({
                "visit_id": transition.visit.id,
                "visit_number": transition.visit.visit_number,
                "patient_id": transition.visit.patient_id,
                "event": transition.plan.event.name(),
                "from": transition.plan.previous.current_stage,
                "to": transition.plan.next.current_stage,
                "overall_status": transition.visit.state.overall_status,
                "version": transition.visit.version,
            }),
        );
    }
}
