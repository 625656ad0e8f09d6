use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::{RateLimitKind, StoreError};
use crate::limits::{LimitPolicy, ModelLimits};
use crate::observability::GatewayMetrics;
use crate::stats::{ModelAggregates, Stats};
use crate::store::{DaySlot, Permit, SharedStore, StartDecision};

// Concurrency sizing fallbacks for an empty stats window.
pub(crate) const DEFAULT_P95_LATENCY_MS: u64 = 60_000;
const CONCURRENCY_SLACK: f64 = 1.3;
const MAX_TARGET_CONCURRENCY: u64 = 1_000;

/// One logical scheduler per model. Every replica runs a contender task; the
/// lease in the shared store elects which one actually schedules. All state
/// the leader touches lives in the store, so leadership can move freely.
pub(crate) struct ModelScheduler {
    model: String,
    holder: String,
    config: Arc<GatewayConfig>,
    store: Arc<dyn SharedStore>,
    policy: Arc<LimitPolicy>,
    stats: Arc<Stats>,
    metrics: Arc<GatewayMetrics>,
}

impl ModelScheduler {
    pub(crate) fn new(
        model: impl Into<String>,
        config: Arc<GatewayConfig>,
        store: Arc<dyn SharedStore>,
        policy: Arc<LimitPolicy>,
        stats: Arc<Stats>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let holder = format!("{}:{:08x}", std::process::id(), rand::random::<u32>());
        Self {
            model: model.into(),
            holder,
            config,
            store,
            policy,
            stats,
            metrics,
        }
    }

    pub(crate) async fn run(self, shutdown: CancellationToken) {
        let retry_interval = Duration::from_millis((self.config.lock_ttl_ms / 3).max(100));
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match self
                .store
                .acquire_lease(&self.model, &self.holder, self.config.lock_ttl_ms)
                .await
            {
                Ok(true) => {
                    info!(model = %self.model, holder = %self.holder, "scheduler lease acquired");
                    self.lead(&shutdown).await;
                    // CAS-guarded: only removes the lease if it is still ours.
                    if let Err(error) = self.store.release_lease(&self.model, &self.holder).await {
                        warn!(model = %self.model, error = %error, "lease release failed");
                    }
                    if shutdown.is_cancelled() {
                        return;
                    }
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(model = %self.model, error = %error, "lease acquisition failed");
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(retry_interval) => {}
            }
        }
    }

    /// Leader loop: schedule until the lease is lost or shutdown is signaled.
    async fn lead(&self, shutdown: &CancellationToken) {
        let poll = Duration::from_millis(self.config.scheduler_poll_ms.max(1));
        // Renew at 60% of the TTL so one missed renewal still leaves slack.
        let renew_every = Duration::from_millis((self.config.lock_ttl_ms * 3 / 5).max(100));
        let mut next_renewal = tokio::time::Instant::now() + renew_every;

        loop {
            if shutdown.is_cancelled() {
                return;
            }

            if tokio::time::Instant::now() >= next_renewal {
                match self
                    .store
                    .renew_lease(&self.model, &self.holder, self.config.lock_ttl_ms)
                    .await
                {
                    Ok(true) => next_renewal = tokio::time::Instant::now() + renew_every,
                    Ok(false) => {
                        info!(model = %self.model, "scheduler lease lost");
                        return;
                    }
                    Err(error) => {
                        // Without a confirmed lease we must assume another
                        // leader exists; yield rather than double-schedule.
                        warn!(model = %self.model, error = %error, "lease renewal failed");
                        return;
                    }
                }
            }

            let progressed = match self.pass().await {
                Ok(progressed) => progressed,
                Err(error) => {
                    warn!(model = %self.model, error = %error, "scheduling pass failed");
                    false
                }
            };

            if !progressed {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }
    }

    /// One scheduling step. `Ok(true)` means a queue entry was consumed and
    /// the next one should be tried without sleeping.
    async fn pass(&self) -> Result<bool, StoreError> {
        self.store.prune_running(&self.model).await?;

        let limits = match self.policy.resolve(&self.model) {
            Ok(resolved) => resolved.limits,
            Err(_) => {
                // Keep the queue draining so waiters fail fast instead of
                // timing out against a model nobody can schedule.
                return self.deny_next(RateLimitKind::Misconfigured, 0).await;
            }
        };

        let aggregates = self.stats.model(&self.model).await?;
        let target = target_concurrency(&limits, &aggregates, self.config.default_est_tokens);
        if self.store.running_count(&self.model).await? >= target {
            return Ok(false);
        }

        let Some(popped) = self.store.dequeue_next(&self.model).await? else {
            return Ok(false);
        };

        let Some(job) = self.store.read_job(&popped.job_id).await? else {
            // The job hash expired while queued; drop the stale id.
            debug!(model = %self.model, job_id = %popped.job_id, "queued job expired");
            return Ok(true);
        };

        if !self
            .store
            .mark_scheduled(&job.job_id, self.config.permit_ttl_ms)
            .await?
        {
            // Already scheduled by a previous leader incarnation.
            return Ok(true);
        }

        let horizon_ms = self.config.permit_ttl_ms;
        let rpd_start = match self
            .store
            .reserve_day_slot(&self.model, &job.job_id, limits.rpd, horizon_ms)
            .await?
        {
            DaySlot::Reserved { start_at_ms } => start_at_ms,
            DaySlot::Denied { retry_after_ms } => {
                self.deny(&job.job_id, RateLimitKind::Rpd, retry_after_ms)
                    .await?;
                return Ok(true);
            }
        };

        let decision = self
            .store
            .reserve_start(
                &self.model,
                limits.rpm_interval_ms(),
                limits.tpm_interval_ms(job.estimated_tokens.max(1)),
                rpd_start,
                horizon_ms,
            )
            .await?;

        match decision {
            StartDecision::Start { start_at_ms } => {
                self.store
                    .write_permit(
                        &job.job_id,
                        &Permit::Start { start_at_ms },
                        self.config.permit_ttl_ms,
                    )
                    .await?;
                self.metrics.record_permit_issued();
                debug!(
                    model = %self.model,
                    job_id = %job.job_id,
                    user_id = %job.user_id,
                    start_at_ms,
                    "permit issued"
                );
                Ok(true)
            }
            StartDecision::Denied {
                kind,
                retry_after_ms,
            } => {
                // The day slot reserved above must not leak into the window.
                self.store
                    .release_day_slot(&self.model, &job.job_id)
                    .await?;
                self.deny(&job.job_id, kind, retry_after_ms).await?;
                Ok(true)
            }
        }
    }

    async fn deny(
        &self,
        job_id: &str,
        kind: RateLimitKind,
        retry_after_ms: u64,
    ) -> Result<(), StoreError> {
        self.store
            .write_permit(
                job_id,
                &Permit::Denied {
                    kind,
                    retry_after_ms,
                },
                self.config.permit_ttl_ms,
            )
            .await?;
        self.metrics.record_permit_denied();
        debug!(
            model = %self.model,
            job_id,
            kind = %kind,
            retry_after_ms,
            "permit denied"
        );
        Ok(())
    }

    async fn deny_next(
        &self,
        kind: RateLimitKind,
        retry_after_ms: u64,
    ) -> Result<bool, StoreError> {
        let Some(popped) = self.store.dequeue_next(&self.model).await? else {
            return Ok(false);
        };
        if !self
            .store
            .mark_scheduled(&popped.job_id, self.config.permit_ttl_ms)
            .await?
        {
            return Ok(true);
        }
        self.deny(&popped.job_id, kind, retry_after_ms).await?;
        Ok(true)
    }
}

/// Little's Law sized to TPM-limited throughput with tail-latency slack,
/// hard-capped so degenerate stats cannot run away.
pub(crate) fn target_concurrency(
    limits: &ModelLimits,
    aggregates: &ModelAggregates,
    default_est_tokens: u64,
) -> u64 {
    let avg_tokens = aggregates
        .mean_tokens
        .unwrap_or(default_est_tokens as f64)
        .max(1.0);
    let p95_ms = aggregates.p95_latency_ms.unwrap_or(DEFAULT_P95_LATENCY_MS) as f64;
    let starts_per_sec = (limits.tpm as f64 / 60.0) / avg_tokens;
    let target = (starts_per_sec * (p95_ms / 1_000.0) * CONCURRENCY_SLACK).ceil();
    (target as u64).clamp(1, MAX_TARGET_CONCURRENCY)
}
