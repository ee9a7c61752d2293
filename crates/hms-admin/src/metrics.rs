//! 业务指标
//!
//! Prometheus 计数器，供 `/metrics` 导出。

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// 指标收集器
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    http_requests_total: IntCounterVec,
    visit_transitions_total: IntCounterVec,
    payments_applied_total: IntCounterVec,
    webhooks_total: IntCounterVec,
    cache_hits_total: IntCounter,
    cache_misses_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("hms_http_requests_total", "Total number of HTTP requests"),
            &["method", "status"],
        )?;
        let visit_transitions_total = IntCounterVec::new(
            Opts::new("hms_visit_transitions_total", "Visit workflow transitions by event"),
            &["event"],
        )?;
        let payments_applied_total = IntCounterVec::new(
            Opts::new("hms_payments_applied_total", "Payments credited to invoices by method"),
            &["method"],
        )?;
        let webhooks_total = IntCounterVec::new(
            Opts::new("hms_webhooks_total", "Payment webhooks by provider and outcome"),
            &["provider", "outcome"],
        )?;
        let cache_hits_total = IntCounter::with_opts(Opts::new("hms_cache_hits_total", "Response cache hits"))?;
        let cache_misses_total = IntCounter::with_opts(Opts::new("hms_cache_misses_total", "Response cache misses"))?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(visit_transitions_total.clone()))?;
        registry.register(Box::new(payments_applied_total.clone()))?;
        registry.register(Box::new(webhooks_total.clone()))?;
        registry.register(Box::new(cache_hits_total.clone()))?;
        registry.register(Box::new(cache_misses_total.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            visit_transitions_total,
            payments_applied_total,
            webhooks_total,
            cache_hits_total,
            cache_misses_total,
        })
    }

    pub fn record_http_request(&self, method: &str, status: u16) {
        self.http_requests_total
            .with_label_values(&[method, &status.to_string()])
            .inc();
    }

    pub fn record_visit_transition(&self, event: &str) {
        self.visit_transitions_total.with_label_values(&[event]).inc();
    }

    pub fn record_payment(&self, method: &str) {
        self.payments_applied_total.with_label_values(&[method]).inc();
    }

    pub fn record_webhook(&self, provider: &str, outcome: &str) {
        self.webhooks_total.with_label_values(&[provider, outcome]).inc();
    }

    pub fn record_cache(&self, hit: bool) {
        if hit {
            self.cache_hits_total.inc();
        } else {
            self.cache_misses_total.inc();
        }
    }

    /// Prometheus 文本格式
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_recorded_series() {
        let metrics = Metrics::new().unwrap();
        metrics.record_http_request("GET", 200);
        metrics.record_visit_transition("complete_triage");
        metrics.record_payment("cash");
        metrics.record_webhook("zenopay", "credited");
        metrics.record_cache(true);
        metrics.record_cache(false);
        metrics.record_cache(false);

        let text = metrics.render().unwrap();
        assert!(text.contains("hms_visit_transitions_total{event=\"complete_triage\"} 1"));
        assert!(text.contains("hms_webhooks_total{outcome=\"credited\",provider=\"zenopay\"} 1"));
        assert!(text.contains("hms_cache_misses_total 2"));
    }
}
