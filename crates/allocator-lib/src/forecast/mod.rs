//! Forecast adapter
//!
//! Wraps the prediction collaborator with a bounded timeout, a per-bucket
//! cache and a conservative fallback. A forecast miss never fails a request:
//! the caller always gets a result, flagged `degraded` when it is a fallback.

mod cache;

pub use cache::ForecastCache;

use crate::config::ForecastConfig;
use crate::error::ForecastError;
use crate::health::{components, HealthRegistry};
use crate::models::{ForecastKey, ForecastResult};
use crate::observability::EngineMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Prediction collaborator. Model internals stay behind this interface.
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    async fn forecast(&self, key: &ForecastKey, horizon: Duration) -> Result<ForecastResult, ForecastError>;
}

pub struct ForecastAdapter {
    provider: Arc<dyn ForecastProvider>,
    cache: ForecastCache,
    last_observed: DashMap<ForecastKey, f64>,
    config: ForecastConfig,
    metrics: EngineMetrics,
    health: HealthRegistry,
}

impl ForecastAdapter {
    pub fn new(
        provider: Arc<dyn ForecastProvider>,
        config: ForecastConfig,
        metrics: EngineMetrics,
        health: HealthRegistry,
    ) -> Self {
        Self {
            provider,
            cache: ForecastCache::new(config.validity_window_secs),
            last_observed: DashMap::new(),
            config,
            metrics,
            health,
        }
    }

    /// Forecast demand for `key` over `window`.
    ///
    /// `baseline_demand` seeds the fallback estimate when nothing was ever
    /// observed for the key.
    pub async fn forecast(&self, key: &ForecastKey, window: Duration, baseline_demand: f64) -> ForecastResult {
        let now = Utc::now();

        if let Some(hit) = self.cache.get(key, now) {
            self.metrics.inc_forecast_request("cache");
            if hit.confidence < self.config.confidence_floor {
                debug!(key = %key, confidence = hit.confidence, "Cached forecast under confidence floor");
                return self
                    .degraded(key, window, baseline_demand, now, "cached forecast under confidence floor")
                    .await;
            }
            return hit;
        }

        match self.fetch(key, window, now).await {
            Ok(result) => {
                self.cache.insert(result.clone(), now);
                if result.confidence < self.config.confidence_floor {
                    return self
                        .degraded(key, window, baseline_demand, now, "forecast under confidence floor")
                        .await;
                }
                self.last_observed.insert(key.clone(), result.predicted_demand);
                self.metrics.inc_forecast_request("collaborator");
                self.health.set_healthy(components::FORECAST).await;
                result
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Forecast unavailable, using fallback estimate");
                self.degraded(key, window, baseline_demand, now, &e.to_string())
                    .await
            }
        }
    }

    async fn fetch(&self, key: &ForecastKey, window: Duration, now: DateTime<Utc>) -> Result<ForecastResult, ForecastError> {
        let timeout = self.config.timeout();
        let mut result = tokio::time::timeout(timeout, self.provider.forecast(key, window))
            .await
            .map_err(|_| ForecastError::Timeout(timeout))??;

        if self.cache.is_stale(&result, now) {
            return Err(ForecastError::Stale {
                age_secs: result.age_secs(now),
                validity_secs: self.config.validity_window_secs,
            });
        }
        if !result.predicted_demand.is_finite() || result.predicted_demand < 0.0 {
            return Err(ForecastError::Collaborator(format!(
                "invalid predicted demand {}",
                result.predicted_demand
            )));
        }
        result.key = key.clone();
        result.confidence = result.confidence.clamp(0.0, 1.0);
        Ok(result)
    }

    /// Conservative estimate: multiplier over the last observed demand
    async fn degraded(
        &self,
        key: &ForecastKey,
        window: Duration,
        baseline_demand: f64,
        now: DateTime<Utc>,
        cause: &str,
    ) -> ForecastResult {
        let observed = self
            .last_observed
            .get(key)
            .map(|d| *d)
            .unwrap_or(baseline_demand);

        self.metrics.inc_forecast_request("fallback");
        self.metrics.inc_forecast_degraded();
        self.health
            .set_degraded(components::FORECAST, format!("{}: {}", key, cause))
            .await;

        ForecastResult {
            key: key.clone(),
            predicted_demand: observed * self.config.fallback_multiplier,
            horizon_secs: window.as_secs(),
            confidence: 0.0,
            generated_at: now,
            degraded: true,
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ComponentStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        demand: f64,
        confidence: f64,
    }

    impl CountingProvider {
        fn new(demand: f64, confidence: f64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                demand,
                confidence,
            }
        }
    }

    #[async_trait]
    impl ForecastProvider for CountingProvider {
        async fn forecast(&self, key: &ForecastKey, horizon: Duration) -> Result<ForecastResult, ForecastError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ForecastResult {
                key: key.clone(),
                predicted_demand: self.demand,
                horizon_secs: horizon.as_secs(),
                confidence: self.confidence,
                generated_at: Utc::now(),
                degraded: false,
            })
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl ForecastProvider for SlowProvider {
        async fn forecast(&self, _key: &ForecastKey, _horizon: Duration) -> Result<ForecastResult, ForecastError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(ForecastError::Collaborator("unreachable".into()))
        }
    }

    struct StaleProvider;

    #[async_trait]
    impl ForecastProvider for StaleProvider {
        async fn forecast(&self, key: &ForecastKey, horizon: Duration) -> Result<ForecastResult, ForecastError> {
            Ok(ForecastResult {
                key: key.clone(),
                predicted_demand: 8.0,
                horizon_secs: horizon.as_secs(),
                confidence: 0.95,
                generated_at: Utc::now() - chrono::Duration::hours(2),
                degraded: false,
            })
        }
    }

    fn adapter(provider: Arc<dyn ForecastProvider>) -> (ForecastAdapter, HealthRegistry) {
        let health = HealthRegistry::new();
        let adapter = ForecastAdapter::new(
            provider,
            ForecastConfig::default(),
            EngineMetrics::new(),
            health.clone(),
        );
        (adapter, health)
    }

    fn key() -> ForecastKey {
        ForecastKey::new("m5.large", "us-east-1")
    }

    #[tokio::test]
    async fn test_cache_bounds_collaborator_calls() {
        let provider = Arc::new(CountingProvider::new(3.0, 0.9));
        let (adapter, _) = adapter(provider.clone());

        let first = adapter.forecast(&key(), Duration::from_secs(3600), 2.0).await;
        let second = adapter.forecast(&key(), Duration::from_secs(3600), 2.0).await;

        assert_eq!(first.predicted_demand, 3.0);
        assert_eq!(second.predicted_demand, first.predicted_demand);
        assert!(!first.degraded);
        // a bucket boundary may fall between the two calls
        assert!(provider.calls.load(Ordering::SeqCst) <= 2);
        assert_eq!(adapter.cached_entries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_degraded_fallback() {
        let (adapter, health) = adapter(Arc::new(SlowProvider));

        let result = adapter.forecast(&key(), Duration::from_secs(3600), 2.0).await;

        assert!(result.degraded);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.predicted_demand, 3.0);
        let forecast = health.component(components::FORECAST).await.unwrap();
        assert_eq!(forecast.status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_low_confidence_is_degraded() {
        let provider = Arc::new(CountingProvider::new(10.0, 0.2));
        let (adapter, _) = adapter(provider.clone());

        let result = adapter.forecast(&key(), Duration::from_secs(3600), 4.0).await;
        assert!(result.degraded);
        assert_eq!(result.confidence, 0.0);
        // nothing trustworthy observed yet, so the baseline seeds the estimate
        assert_eq!(result.predicted_demand, 6.0);

        // a cached low-confidence hit is still degraded and skips the collaborator
        let again = adapter.forecast(&key(), Duration::from_secs(3600), 4.0).await;
        assert!(again.degraded);
    }

    #[tokio::test]
    async fn test_stale_collaborator_result_rejected() {
        let (adapter, _) = adapter(Arc::new(StaleProvider));
        let result = adapter.forecast(&key(), Duration::from_secs(3600), 2.0).await;
        assert!(result.degraded);
        assert_eq!(adapter.cached_entries(), 0);
    }

    #[tokio::test]
    async fn test_fallback_uses_last_observed_demand() {
        let healthy = Arc::new(CountingProvider::new(5.0, 0.9));
        let (adapter, _) = adapter(healthy);
        adapter.forecast(&key(), Duration::from_secs(3600), 1.0).await;

        let observed = adapter.last_observed.get(&key()).map(|d| *d);
        assert_eq!(observed, Some(5.0));

        let fallback = adapter
            .degraded(&key(), Duration::from_secs(3600), 1.0, Utc::now(), "test")
            .await;
        assert_eq!(fallback.predicted_demand, 7.5);
    }
}
