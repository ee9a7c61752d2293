//! 接口响应缓存
//!
//! 就诊和预约的读接口按命名空间缓存。每个命名空间带一个代数计数器，缓存键包含
//! 读取时的代数；写操作调用 `invalidate` 后代数加一，之前写入的键全部失效。

use hms_admin::config::CacheConfig;
use hms_admin::Metrics;
use hms_core::Result;
use moka::future::Cache;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const VISITS: &str = "visits";
pub const APPOINTMENTS: &str = "appointments";

#[derive(Clone)]
struct Namespace {
    entries: Cache<String, serde_json::Value>,
    generation: Arc<AtomicU64>,
}

/// 带TTL的响应缓存
#[derive(Clone)]
pub struct ResponseCache {
    enabled: bool,
    namespaces: Arc<HashMap<&'static str, Namespace>>,
    metrics: Metrics,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig, metrics: Metrics) -> Self {
        let mut namespaces = HashMap::new();
        for (name, ttl) in [
            (VISITS, config.visits_ttl_secs),
            (APPOINTMENTS, config.appointments_ttl_secs),
        ] {
            let entries = Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(Duration::from_secs(ttl.max(1)))
                .build();
            namespaces.insert(
                name,
                Namespace {
                    entries,
                    generation: Arc::new(AtomicU64::new(0)),
                },
            );
        }

        Self {
            enabled: config.enabled,
            namespaces: Arc::new(namespaces),
            metrics,
        }
    }

    /// 命中则返回缓存值，否则执行 `load` 并写入缓存
    ///
    /// 代数在加载前读取，加载期间发生的失效会让这次写入的键不再被命中。
    pub async fn get_or_load<T, F, Fut>(&self, namespace: &str, key: &str, load: F) -> Result<serde_json::Value>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(ns) = self.namespaces.get(namespace).filter(|_| self.enabled) else {
            return Ok(serde_json::to_value(load().await?)?);
        };

        let generation = ns.generation.load(Ordering::Acquire);
        let cache_key = format!("{}:{}", generation, key);
        if let Some(value) = ns.entries.get(&cache_key).await {
            debug!("Cache hit {}/{}", namespace, key);
            self.metrics.record_cache(true);
            return Ok(value);
        }

        self.metrics.record_cache(false);
        let value = serde_json::to_value(load().await?)?;
        ns.entries.insert(cache_key, value.clone()).await;
        Ok(value)
    }

    /// 使命名空间内所有已缓存的响应失效
    pub fn invalidate(&self, namespace: &str) {
        if let Some(ns) = self.namespaces.get(namespace) {
            let generation = ns.generation.fetch_add(1, Ordering::AcqRel) + 1;
            ns.entries.invalidate_all();
            debug!("Cache namespace {} now at generation {}", namespace, generation);
        }
    }

    /// 就诊变化可能连带预约状态变化
    pub fn invalidate_workflow(&self) {
        self.invalidate(VISITS);
        self.invalidate(APPOINTMENTS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn cache(enabled: bool) -> ResponseCache {
        let config = CacheConfig {
            enabled,
            ..CacheConfig::default()
        };
        ResponseCache::new(&config, Metrics::new().unwrap())
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let cache = cache(true);
        let loads = AtomicUsize::new(0);
        let load = |value: &'static str| {
            let loads = &loads;
            move || async move {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok::<_, hms_core::HmsError>(value)
            }
        };

        let first = cache.get_or_load(VISITS, "visit:1", load("reception")).await.unwrap();
        let second = cache.get_or_load(VISITS, "visit:1", load("nurse")).await.unwrap();
        assert_eq!(first, "reception");
        assert_eq!(second, "reception");
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        cache.invalidate(VISITS);
        let third = cache.get_or_load(VISITS, "visit:1", load("nurse")).await.unwrap();
        assert_eq!(third, "nurse");
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_namespaces_are_independent() {
        let cache = cache(true);
        cache
            .get_or_load(APPOINTMENTS, "list", || async { Ok(vec![1, 2]) })
            .await
            .unwrap();
        cache.invalidate(VISITS);

        let cached = cache
            .get_or_load(APPOINTMENTS, "list", || async { Ok(vec![3]) })
            .await
            .unwrap();
        assert_eq!(cached, serde_json::json!([1, 2]));

        cache.invalidate_workflow();
        let fresh = cache
            .get_or_load(APPOINTMENTS, "list", || async { Ok(vec![3]) })
            .await
            .unwrap();
        assert_eq!(fresh, serde_json::json!([3]));
    }

    #[tokio::test]
    async fn test_disabled_cache_always_loads() {
        let cache = cache(false);
        cache.get_or_load(VISITS, "k", || async { Ok(1) }).await.unwrap();
        let value = cache.get_or_load(VISITS, "k", || async { Ok(2) }).await.unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = cache(true);
        let failed: Result<serde_json::Value> = cache
            .get_or_load(VISITS, "k", || async {
                Err::<i32, _>(hms_core::HmsError::NotFound("visit".to_string()))
            })
            .await;
        assert!(failed.is_err());
        let value = cache.get_or_load(VISITS, "k", || async { Ok(5) }).await.unwrap();
        assert_eq!(value, 5);
    }
}
