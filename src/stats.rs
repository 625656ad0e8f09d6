use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::store::SharedStore;

/// How long derived aggregates may be served without re-reading the store.
/// Staleness only affects concurrency sizing and estimate overrides, never
/// quota accounting.
const CACHE_TTL: Duration = Duration::from_secs(5);

/// Rolling aggregates for one model, derived from the shared sample lists.
/// `None` means the window is empty and callers should use their fallback.
#[derive(Clone, Copy, Debug, Default)]
pub struct ModelAggregates {
    pub mean_tokens: Option<f64>,
    pub p95_latency_ms: Option<u64>,
    pub samples: usize,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RouteAggregates {
    pub mean_tokens: Option<f64>,
    pub samples: usize,
}

/// Operator-facing view of one model's rolling usage.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct UsageSummary {
    pub mean_tokens: Option<f64>,
    pub p95_latency_ms: Option<u64>,
    pub samples: usize,
    pub in_flight: u64,
}

/// Read side of the rolling stats: samples live in the shared store, derived
/// aggregates are cached in-process for [`CACHE_TTL`].
pub struct Stats {
    store: Arc<dyn SharedStore>,
    window: usize,
    cache: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    models: HashMap<String, Cached<ModelAggregates>>,
    routes: HashMap<(String, String), Cached<RouteAggregates>>,
}

struct Cached<T> {
    value: T,
    refreshed_at: Instant,
}

impl<T: Copy> Cached<T> {
    fn fresh(&self) -> Option<T> {
        (self.refreshed_at.elapsed() < CACHE_TTL).then_some(self.value)
    }
}

impl Stats {
    pub fn new(store: Arc<dyn SharedStore>, window: usize) -> Self {
        Self {
            store,
            window: window.max(1),
            cache: Mutex::new(CacheState::default()),
        }
    }

    pub async fn record(
        &self,
        model: &str,
        route: &str,
        latency_ms: u64,
        tokens: u64,
    ) -> Result<(), StoreError> {
        self.store
            .record_call(model, route, latency_ms, tokens, self.window)
            .await
    }

    pub async fn model(&self, model: &str) -> Result<ModelAggregates, StoreError> {
        if let Some(hit) = self.lock().models.get(model).and_then(Cached::fresh) {
            return Ok(hit);
        }

        let latencies = self.store.latency_samples(model, self.window).await?;
        let tokens = self.store.token_samples(model, self.window).await?;
        let aggregates = ModelAggregates {
            mean_tokens: mean(&tokens),
            p95_latency_ms: p95(&latencies),
            samples: tokens.len(),
        };

        self.lock().models.insert(
            model.to_string(),
            Cached {
                value: aggregates,
                refreshed_at: Instant::now(),
            },
        );
        Ok(aggregates)
    }

    pub async fn route(&self, model: &str, route: &str) -> Result<RouteAggregates, StoreError> {
        let cache_key = (model.to_string(), route.to_string());
        if let Some(hit) = self.lock().routes.get(&cache_key).and_then(Cached::fresh) {
            return Ok(hit);
        }

        let tokens = self.store.route_token_samples(model, route, self.window).await?;
        let aggregates = RouteAggregates {
            mean_tokens: mean(&tokens),
            samples: tokens.len(),
        };

        self.lock().routes.insert(
            cache_key,
            Cached {
                value: aggregates,
                refreshed_at: Instant::now(),
            },
        );
        Ok(aggregates)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn mean(samples: &[u64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let total: u128 = samples.iter().map(|value| u128::from(*value)).sum();
    Some(total as f64 / samples.len() as f64)
}

/// Nearest-rank p95 over the window.
fn p95(samples: &[u64]) -> Option<u64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let rank = (sorted.len() as f64 * 0.95).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}
