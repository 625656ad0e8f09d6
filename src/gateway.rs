//! The public surface: a [`Gateway`] admits every outbound model call,
//! spacing starts so that all replicas together stay inside each model's
//! shared RPM/TPM/RPD quotas.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::Stream;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result, UpstreamError};
use crate::estimate::{HeuristicEstimator, TokenEstimator};
use crate::limits::{LimitsConfig, ModelLimits};
use crate::observability::MetricsSnapshot;
use crate::pipeline::{Pipeline, PreparedJob};
use crate::retry::{is_retryable, retry_after_hint};
use crate::scheduler::ModelScheduler;
use crate::stats::UsageSummary;
use crate::store::SharedStore;
use crate::stream::{ChunkUsage, MeteredStream};

/// One outbound call, described before any admission work happens.
#[derive(Clone, Debug)]
pub struct CallRequest {
    /// Model name as the caller knows it; canonicalized during admission.
    pub model: String,
    /// Fairness bucket. Calls without one share a per-route system bucket.
    pub user_id: Option<String>,
    /// Logical call site, used for per-route token statistics.
    pub route: Option<String>,
    /// Caller's expectation of completion size, in tokens.
    pub completion_tokens_hint: Option<u64>,
    /// The message payload the estimator sizes up.
    pub payload: Value,
}

impl CallRequest {
    pub fn new(model: impl Into<String>, payload: Value) -> Self {
        Self {
            model: model.into(),
            user_id: None,
            route: None,
            completion_tokens_hint: None,
            payload,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_completion_tokens_hint(mut self, hint: u64) -> Self {
        self.completion_tokens_hint = Some(hint);
        self
    }
}

/// What a completed upstream call hands back: the caller's value plus the
/// provider-reported token count when the response carried one.
#[derive(Clone, Debug)]
pub struct CallOutcome<T> {
    pub value: T,
    pub actual_tokens: Option<u64>,
}

impl<T> CallOutcome<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            actual_tokens: None,
        }
    }

    pub fn with_actual_tokens(mut self, tokens: u64) -> Self {
        self.actual_tokens = Some(tokens);
        self
    }
}

/// Admission control for outbound LLM calls, shared across replicas through
/// a [`SharedStore`]. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Gateway {
    pipeline: Arc<Pipeline>,
    schedulers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Builds a gateway over `store` with the default heuristic estimator.
    pub fn new(config: GatewayConfig, store: Arc<dyn SharedStore>) -> Result<Self> {
        let estimator = Arc::new(HeuristicEstimator::new(config.default_est_tokens));
        Self::with_estimator(config, store, estimator)
    }

    /// Builds a gateway with a caller-provided token estimator.
    pub fn with_estimator(
        config: GatewayConfig,
        store: Arc<dyn SharedStore>,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pipeline: Arc::new(Pipeline::new(Arc::new(config), store, estimator)),
            schedulers: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        })
    }

    /// Runs one upstream call under admission control.
    ///
    /// `call` is invoked once per attempt with the attempt number. Transient
    /// failures (network errors, configured status codes, permit timeouts)
    /// are retried with jittered exponential backoff; an upstream
    /// `Retry-After` floors the pause.
    pub async fn invoke<T, F, Fut>(&self, request: CallRequest, mut call: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<CallOutcome<T>, UpstreamError>>,
    {
        let job = self.pipeline.prepare(&request).await?;
        self.ensure_scheduler(&job.model);
        let mut attempt = 0u32;
        loop {
            match self.pipeline.attempt_invoke(&job, attempt, &mut call).await {
                Ok(value) => return Ok(value),
                Err(error) => attempt = self.next_attempt(&job, attempt, error).await?,
            }
        }
    }

    /// Opens a streaming upstream call under admission control.
    ///
    /// Retries apply until the first chunk arrives; from then on the stream
    /// belongs to the caller and failures are yielded, not retried.
    pub async fn stream<C, S, F, Fut>(
        &self,
        request: CallRequest,
        mut open: F,
    ) -> Result<MeteredStream<C>>
    where
        C: ChunkUsage + Send + 'static,
        S: Stream<Item = std::result::Result<C, UpstreamError>> + Send + 'static,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<S, UpstreamError>>,
    {
        let job = self.pipeline.prepare(&request).await?;
        self.ensure_scheduler(&job.model);
        let mut attempt = 0u32;
        loop {
            match self.pipeline.attempt_stream(&job, attempt, &mut open).await {
                Ok(stream) => return Ok(stream),
                Err(error) => attempt = self.next_attempt(&job, attempt, error).await?,
            }
        }
    }

    /// Replaces the whole limit table. Calls observe the change on their next
    /// admission; nothing already paced is re-planned.
    pub fn replace_limits(&self, limits: &LimitsConfig) {
        self.pipeline.policy.replace(limits.build());
    }

    /// Overrides one model's limits at runtime.
    pub fn set_model_limits(&self, model: impl Into<String>, limits: ModelLimits) {
        self.pipeline.policy.set_model(model, limits);
    }

    /// Counters accumulated since this gateway was built.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.pipeline.metrics.snapshot()
    }

    /// Rolling-window usage for one model, plus its current in-flight count.
    pub async fn usage(&self, model: &str) -> Result<UsageSummary> {
        let key = match self.pipeline.policy.resolve(model) {
            Ok(resolved) => resolved.key.as_str().to_string(),
            Err(invalid) => invalid.model,
        };
        let aggregates = self.pipeline.stats.model(&key).await?;
        let in_flight = self.pipeline.store.running_count(&key).await?;
        Ok(UsageSummary {
            mean_tokens: aggregates.mean_tokens,
            p95_latency_ms: aggregates.p95_latency_ms,
            samples: aggregates.samples,
            in_flight,
        })
    }

    /// Stops every scheduler contender and waits for them to exit. Calls in
    /// flight are unaffected; their cleanup runs on their own tasks.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut schedulers = self
                .schedulers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            schedulers.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Spawns the scheduler contender for `model` the first time a call
    /// references it.
    fn ensure_scheduler(&self, model: &str) {
        let mut schedulers = self
            .schedulers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if schedulers.contains_key(model) {
            return;
        }
        let scheduler = ModelScheduler::new(
            model,
            Arc::clone(&self.pipeline.config),
            Arc::clone(&self.pipeline.store),
            Arc::clone(&self.pipeline.policy),
            Arc::clone(&self.pipeline.stats),
            Arc::clone(&self.pipeline.metrics),
        );
        debug!(model, "starting scheduler contender");
        schedulers.insert(
            model.to_string(),
            tokio::spawn(scheduler.run(self.shutdown.child_token())),
        );
    }

    async fn next_attempt(
        &self,
        job: &PreparedJob,
        attempt: u32,
        error: GatewayError,
    ) -> Result<u32> {
        let codes = &self.pipeline.config.retry_status_codes;
        if !(is_retryable(&error, codes) && self.pipeline.backoff.can_retry(attempt)) {
            return Err(error);
        }
        self.pipeline.metrics.record_retry();
        let delay = self.pipeline.backoff.delay(attempt, retry_after_hint(&error));
        debug!(
            job_id = %job.job_id,
            model = %job.model,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying after transient failure"
        );
        tokio::time::sleep(delay).await;
        Ok(attempt + 1)
    }
}
