//! Per-call admission machinery shared by `invoke` and `stream`: enqueue the
//! job, wait for the scheduler's permit, pace to the reserved start, take an
//! in-flight slot, then settle quotas and stats once the upstream call ends.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, RateLimitKind, Result, StoreError, UpstreamError};
use crate::estimate::{TokenEstimator, estimate_with_route_mean};
use crate::gateway::{CallOutcome, CallRequest};
use crate::limits::{LimitPolicy, ModelLimits};
use crate::observability::GatewayMetrics;
use crate::retry::BackoffPolicy;
use crate::scheduler::{DEFAULT_P95_LATENCY_MS, target_concurrency};
use crate::stats::Stats;
use crate::store::{JobRecord, Permit, SharedStore};
use crate::stream::{ChunkUsage, MeteredStream, StreamFinalizer};

/// Floor for the in-flight eviction horizon. A crashed holder is reclaimed
/// after this long even when the latency window suggests faster calls.
const MIN_EVICT_HORIZON_MS: u64 = 120_000;

/// Pause between attempts to take an in-flight slot while the set is full.
const SLOT_RETRY_MS: u64 = 50;

/// One admission pipeline per gateway, shared by every call and stream.
pub(crate) struct Pipeline {
    pub(crate) config: Arc<GatewayConfig>,
    pub(crate) store: Arc<dyn SharedStore>,
    pub(crate) policy: Arc<LimitPolicy>,
    pub(crate) estimator: Arc<dyn TokenEstimator>,
    pub(crate) stats: Arc<Stats>,
    pub(crate) metrics: Arc<GatewayMetrics>,
    pub(crate) backoff: BackoffPolicy,
    failures: FailureTally,
    job_seq: AtomicU64,
}

/// A call resolved against the limit table, with its token estimate fixed.
/// The job id stays stable across retry attempts.
pub(crate) struct PreparedJob {
    pub(crate) job_id: String,
    pub(crate) model: String,
    pub(crate) user_id: String,
    pub(crate) route: String,
    pub(crate) limits: ModelLimits,
    pub(crate) estimated_tokens: u64,
}

/// Outcome of admission. `Unmetered` is the fail-open path: the upstream
/// call proceeds without quota accounting because the store is unavailable.
pub(crate) enum Admission {
    Metered(RunningJob),
    Unmetered,
}

/// A job holding an in-flight slot. Must be settled through the pipeline;
/// dropping it instead triggers background cleanup.
pub(crate) struct RunningJob {
    guard: JobGuard,
    route: String,
    limits: ModelLimits,
    estimated_tokens: u64,
}

impl RunningJob {
    pub(crate) fn job_id(&self) -> &str {
        &self.guard.job_id
    }

    pub(crate) fn model(&self) -> &str {
        &self.guard.model
    }
}

impl Pipeline {
    pub(crate) fn new(
        config: Arc<GatewayConfig>,
        store: Arc<dyn SharedStore>,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Self {
        let policy = Arc::new(LimitPolicy::new(config.limits.build()));
        let stats = Arc::new(Stats::new(Arc::clone(&store), config.stats_window));
        let backoff = BackoffPolicy::new(
            config.backoff_base_s,
            config.backoff_cap_s,
            config.max_retries,
        );
        let failures = FailureTally::new(
            config.store_failure_burst,
            Duration::from_secs(config.store_failure_cooldown_s),
        );
        Self {
            config,
            store,
            policy,
            estimator,
            stats,
            metrics: Arc::new(GatewayMetrics::default()),
            backoff,
            failures,
            job_seq: AtomicU64::new(0),
        }
    }

    /// Resolves limits, fixes the token estimate, and rejects calls that can
    /// never be admitted, all before anything touches the queue.
    pub(crate) async fn prepare(&self, request: &CallRequest) -> Result<PreparedJob> {
        let route = request
            .route
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let resolved = match self.policy.resolve(&request.model) {
            Ok(resolved) => resolved,
            Err(invalid) => {
                warn!(model = %invalid.model, reason = %invalid.reason, "model limits unusable");
                self.metrics.record_rate_limited(RateLimitKind::Misconfigured);
                return Err(GatewayError::RateLimited {
                    kind: RateLimitKind::Misconfigured,
                    model: invalid.model,
                    route,
                    retry_after_s: None,
                });
            }
        };
        let model = resolved.key.as_str().to_string();
        let user_id = request
            .user_id
            .clone()
            .unwrap_or_else(|| format!("system:{route}"));

        let structural = self
            .estimator
            .estimate(&request.payload, request.completion_tokens_hint);
        let estimated_tokens = match self.stats.route(&model, &route).await {
            Ok(aggregates) => match aggregates.mean_tokens {
                Some(mean) => estimate_with_route_mean(structural, mean, aggregates.samples),
                None => structural,
            },
            Err(error) => {
                self.note_store_failure("estimate", &error);
                structural
            }
        };

        // A call larger than the burst allowance can never be paced in.
        if estimated_tokens > resolved.limits.tpm_burst {
            self.metrics
                .record_rate_limited(RateLimitKind::TpmCallTooLarge);
            return Err(GatewayError::RateLimited {
                kind: RateLimitKind::TpmCallTooLarge,
                model,
                route,
                retry_after_s: None,
            });
        }

        Ok(PreparedJob {
            job_id: self.next_job_id(),
            model,
            user_id,
            route,
            limits: resolved.limits,
            estimated_tokens,
        })
    }

    /// Runs one attempt of a unary call: admit, invoke, settle.
    pub(crate) async fn attempt_invoke<T, F, Fut>(
        &self,
        job: &PreparedJob,
        attempt: u32,
        call: &mut F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<CallOutcome<T>, UpstreamError>>,
    {
        let admission = self.admit(job, attempt).await?;
        let started = Instant::now();
        match call(attempt).await {
            Ok(outcome) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                let tokens = outcome.actual_tokens.unwrap_or(job.estimated_tokens);
                if let Admission::Metered(running) = admission {
                    self.settle_success(running, latency_ms, outcome.actual_tokens)
                        .await;
                }
                self.metrics.record_completion();
                info!(
                    job_id = %job.job_id,
                    model = %job.model,
                    user_id = %job.user_id,
                    attempt,
                    latency_ms,
                    tokens,
                    "call completed"
                );
                Ok(outcome.value)
            }
            Err(error) => {
                if let Admission::Metered(running) = admission {
                    self.settle_failure(running).await;
                }
                self.metrics.record_upstream_error();
                warn!(
                    job_id = %job.job_id,
                    model = %job.model,
                    user_id = %job.user_id,
                    attempt,
                    error = %error,
                    "upstream call failed"
                );
                Err(GatewayError::Upstream(error))
            }
        }
    }

    /// Runs one attempt of a streaming call. The first chunk is pulled here,
    /// while the attempt can still be retried; everything after it belongs to
    /// the returned [`MeteredStream`].
    pub(crate) async fn attempt_stream<C, S, F, Fut>(
        self: &Arc<Self>,
        job: &PreparedJob,
        attempt: u32,
        open: &mut F,
    ) -> Result<MeteredStream<C>>
    where
        C: ChunkUsage + Send + 'static,
        S: Stream<Item = std::result::Result<C, UpstreamError>> + Send + 'static,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<S, UpstreamError>>,
    {
        let admission = self.admit(job, attempt).await?;
        let started = Instant::now();
        let upstream = match open(attempt).await {
            Ok(upstream) => upstream,
            Err(error) => {
                if let Admission::Metered(running) = admission {
                    self.settle_failure(running).await;
                }
                self.metrics.record_upstream_error();
                warn!(
                    job_id = %job.job_id,
                    model = %job.model,
                    attempt,
                    error = %error,
                    "opening upstream stream failed"
                );
                return Err(GatewayError::Upstream(error));
            }
        };

        let mut upstream = Box::pin(upstream);
        match upstream.next().await {
            None => {
                // An empty stream is a completed call; the estimate stands.
                let latency_ms = started.elapsed().as_millis() as u64;
                if let Admission::Metered(running) = admission {
                    self.settle_success(running, latency_ms, None).await;
                }
                self.metrics.record_completion();
                Ok(MeteredStream::finished())
            }
            Some(Err(error)) => {
                if let Admission::Metered(running) = admission {
                    self.settle_failure(running).await;
                }
                self.metrics.record_upstream_error();
                warn!(
                    job_id = %job.job_id,
                    model = %job.model,
                    attempt,
                    error = %error,
                    "stream failed before its first chunk"
                );
                Err(GatewayError::Upstream(error))
            }
            Some(Ok(first)) => {
                self.metrics.record_stream_opened();
                let running = match admission {
                    Admission::Metered(running) => Some(running),
                    Admission::Unmetered => None,
                };
                let finalizer = StreamFinalizer::new(Arc::clone(self), running, started);
                Ok(MeteredStream::open(upstream, first, finalizer))
            }
        }
    }

    /// Takes one attempt through enqueue, permit wait, pacing sleep, and slot
    /// acquisition. Store failures either fail the call or degrade to an
    /// unmetered admission, depending on `fail_open`.
    pub(crate) async fn admit(&self, job: &PreparedJob, attempt: u32) -> Result<Admission> {
        let record = JobRecord {
            job_id: job.job_id.clone(),
            model: job.model.clone(),
            user_id: job.user_id.clone(),
            route: job.route.clone(),
            estimated_tokens: job.estimated_tokens,
            attempt,
            enqueued_at_ms: 0,
        };
        let mut guard = JobGuard {
            store: Arc::clone(&self.store),
            model: job.model.clone(),
            user_id: job.user_id.clone(),
            job_id: job.job_id.clone(),
            attempt,
            queued: false,
            holding_slot: false,
            armed: true,
        };

        // Job state outlives the permit horizon so late cleanup still finds it.
        let job_ttl_ms = self.config.permit_ttl_ms.saturating_mul(2);
        match self.store.enqueue_job(&record, job_ttl_ms).await {
            Ok(fresh) => {
                guard.queued = true;
                if fresh {
                    self.metrics.record_enqueued();
                    info!(
                        job_id = %job.job_id,
                        model = %job.model,
                        user_id = %job.user_id,
                        attempt,
                        tokens = job.estimated_tokens,
                        "call enqueued"
                    );
                }
            }
            Err(error) => return self.fail_open(guard, "enqueue", error).await,
        }

        let poll = Duration::from_millis(self.config.scheduler_poll_ms.max(1));
        let wait_budget = Duration::from_millis(self.config.permit_wait_ms);
        let waited_from = Instant::now();
        let permit = loop {
            match self.store.read_permit(&job.job_id).await {
                Ok(Some(permit)) => break permit,
                Ok(None) => {}
                Err(error) => return self.fail_open(guard, "permit poll", error).await,
            }
            if waited_from.elapsed() >= wait_budget {
                let waited_ms = waited_from.elapsed().as_millis() as u64;
                return Err(self.give_up_waiting(guard, job, waited_ms).await);
            }
            tokio::time::sleep(poll).await;
        };
        // A permit, either way, means the scheduler already popped the queue.
        guard.queued = false;

        let start_at_ms = match permit {
            Permit::Denied {
                kind,
                retry_after_ms,
            } => {
                self.finish_quietly(&mut guard).await;
                self.metrics.record_rate_limited(kind);
                let retry_after_s = (retry_after_ms > 0).then(|| retry_after_ms as f64 / 1_000.0);
                warn!(
                    job_id = %job.job_id,
                    model = %job.model,
                    user_id = %job.user_id,
                    attempt,
                    kind = %kind,
                    retry_after_ms,
                    "call rate limited"
                );
                return Err(GatewayError::RateLimited {
                    kind,
                    model: job.model.clone(),
                    route: job.route.clone(),
                    retry_after_s,
                });
            }
            Permit::Start { start_at_ms } => start_at_ms,
        };
        info!(
            job_id = %job.job_id,
            model = %job.model,
            user_id = %job.user_id,
            attempt,
            start_at_ms,
            "permit granted"
        );

        let now_ms = match self.store.now_ms().await {
            Ok(now_ms) => now_ms,
            Err(error) => return self.fail_open(guard, "clock", error).await,
        };
        let jitter_ms = wake_jitter_ms(&job.user_id, &job.job_id, self.config.jitter_max_ms);
        let delay_ms = start_at_ms.saturating_sub(now_ms) + jitter_ms;
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        let slot_from = Instant::now();
        loop {
            let aggregates = match self.stats.model(&job.model).await {
                Ok(aggregates) => aggregates,
                Err(error) => return self.fail_open(guard, "stats", error).await,
            };
            let target =
                target_concurrency(&job.limits, &aggregates, self.config.default_est_tokens);
            let p95_ms = aggregates.p95_latency_ms.unwrap_or(DEFAULT_P95_LATENCY_MS);
            let now_ms = match self.store.now_ms().await {
                Ok(now_ms) => now_ms,
                Err(error) => return self.fail_open(guard, "clock", error).await,
            };
            let evict_at_ms = now_ms + (2 * p95_ms).max(MIN_EVICT_HORIZON_MS);
            match self
                .store
                .try_begin_running(&job.model, &job.job_id, target, evict_at_ms)
                .await
            {
                Ok(true) => break,
                Ok(false) => {
                    if slot_from.elapsed() >= wait_budget {
                        let waited_ms = waited_from.elapsed().as_millis() as u64;
                        return Err(self.give_up_waiting(guard, job, waited_ms).await);
                    }
                    tokio::time::sleep(Duration::from_millis(SLOT_RETRY_MS)).await;
                }
                Err(error) => return self.fail_open(guard, "slot", error).await,
            }
        }
        guard.holding_slot = true;

        Ok(Admission::Metered(RunningJob {
            guard,
            route: job.route.clone(),
            limits: job.limits,
            estimated_tokens: job.estimated_tokens,
        }))
    }

    /// Settles a successful call: record stats, reconcile the TPM pacer
    /// against observed tokens, release the slot, clear job state.
    pub(crate) async fn settle_success(
        &self,
        mut running: RunningJob,
        latency_ms: u64,
        actual_tokens: Option<u64>,
    ) {
        let tokens = actual_tokens.unwrap_or(running.estimated_tokens);
        let model = running.guard.model.clone();
        if let Err(error) = self
            .stats
            .record(&model, &running.route, latency_ms, tokens)
            .await
        {
            self.note_store_failure("stats record", &error);
        }
        let delta_ms = running
            .limits
            .reconcile_delta_ms(running.estimated_tokens, tokens);
        if delta_ms != 0 {
            if let Err(error) = self.store.shift_tpm_pacer(&model, delta_ms).await {
                self.note_store_failure("tpm reconcile", &error);
            }
        }
        self.release(&mut running.guard).await;
    }

    /// Settles a failed call: release the slot and clear job state without
    /// recording stats or touching the pacers.
    pub(crate) async fn settle_failure(&self, mut running: RunningJob) {
        self.release(&mut running.guard).await;
    }

    async fn release(&self, guard: &mut JobGuard) {
        if guard.holding_slot {
            if let Err(error) = self.store.end_running(&guard.model, &guard.job_id).await {
                self.note_store_failure("slot release", &error);
            }
            guard.holding_slot = false;
        }
        if let Err(error) = self.store.clear_job(&guard.job_id, guard.attempt).await {
            self.note_store_failure("job cleanup", &error);
        }
        guard.disarm();
    }

    /// Best-effort cleanup on paths where the call is being refused anyway.
    async fn finish_quietly(&self, guard: &mut JobGuard) {
        if guard.queued {
            let _ = self
                .store
                .abandon_queued(&guard.model, &guard.user_id, &guard.job_id)
                .await;
            guard.queued = false;
        }
        if guard.holding_slot {
            let _ = self.store.end_running(&guard.model, &guard.job_id).await;
            guard.holding_slot = false;
        }
        let _ = self.store.clear_job(&guard.job_id, guard.attempt).await;
        guard.disarm();
    }

    async fn fail_open(
        &self,
        mut guard: JobGuard,
        stage: &'static str,
        error: StoreError,
    ) -> Result<Admission> {
        self.note_store_failure(stage, &error);
        self.finish_quietly(&mut guard).await;
        if self.config.fail_open {
            self.metrics.record_fail_open();
            debug!(stage, "admitting call without metering");
            Ok(Admission::Unmetered)
        } else {
            Err(GatewayError::Store(error))
        }
    }

    async fn give_up_waiting(
        &self,
        mut guard: JobGuard,
        job: &PreparedJob,
        waited_ms: u64,
    ) -> GatewayError {
        self.finish_quietly(&mut guard).await;
        self.metrics.record_permit_timeout();
        warn!(
            job_id = %job.job_id,
            model = %job.model,
            user_id = %job.user_id,
            waited_ms,
            "gave up waiting for a permit"
        );
        GatewayError::PermitTimeout {
            job_id: job.job_id.clone(),
            model: job.model.clone(),
            waited_ms,
        }
    }

    fn note_store_failure(&self, stage: &'static str, error: &StoreError) {
        self.metrics.record_store_failure();
        if self.failures.should_warn() {
            warn!(stage, error = %error, "shared store failure");
        } else {
            debug!(stage, error = %error, "shared store failure (warning suppressed)");
        }
    }

    fn next_job_id(&self) -> String {
        let seq = self.job_seq.fetch_add(1, Ordering::Relaxed);
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);
        format!("{now_ms:x}-{seq:x}-{:04x}", rand::random::<u16>())
    }
}

/// Owns the durable traces a job leaves in the store. Terminal paths clean
/// up inline and disarm; dropping an armed guard (caller cancelled the
/// future) pushes the same cleanup to a spawned task.
struct JobGuard {
    store: Arc<dyn SharedStore>,
    model: String,
    user_id: String,
    job_id: String,
    attempt: u32,
    queued: bool,
    holding_slot: bool,
    armed: bool,
}

impl JobGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = Arc::clone(&self.store);
        let model = std::mem::take(&mut self.model);
        let user_id = std::mem::take(&mut self.user_id);
        let job_id = std::mem::take(&mut self.job_id);
        let attempt = self.attempt;
        let queued = self.queued;
        let holding_slot = self.holding_slot;
        let cleanup = async move {
            if queued {
                let _ = store.abandon_queued(&model, &user_id, &job_id).await;
            }
            if holding_slot {
                let _ = store.end_running(&model, &job_id).await;
            }
            let _ = store.clear_job(&job_id, attempt).await;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cleanup);
            }
            Err(_) => {
                let _ = std::thread::Builder::new()
                    .name("tollgate-job-cleanup".to_string())
                    .spawn(move || {
                        let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        else {
                            return;
                        };
                        runtime.block_on(cleanup);
                    });
            }
        }
    }
}

/// Deterministic wake-up jitter so replicas granted the same start do not
/// stampede the in-flight set together.
fn wake_jitter_ms(user_id: &str, job_id: &str, jitter_max_ms: u64) -> u64 {
    if jitter_max_ms == 0 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);
    job_id.hash(&mut hasher);
    hasher.finish() % (jitter_max_ms + 1)
}

/// Rate limits "shared store failure" warnings: the first burst in each
/// cooldown window is logged at warn, the rest drop to debug.
struct FailureTally {
    burst: u32,
    cooldown: Duration,
    window: Mutex<TallyWindow>,
}

#[derive(Default)]
struct TallyWindow {
    opened_at: Option<Instant>,
    count: u32,
}

impl FailureTally {
    fn new(burst: u32, cooldown: Duration) -> Self {
        Self {
            burst,
            cooldown,
            window: Mutex::new(TallyWindow::default()),
        }
    }

    fn should_warn(&self) -> bool {
        let mut window = self
            .window
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match window.opened_at {
            Some(opened) if now.duration_since(opened) < self.cooldown => {
                window.count += 1;
                window.count <= self.burst
            }
            _ => {
                window.opened_at = Some(now);
                window.count = 1;
                true
            }
        }
    }
}
