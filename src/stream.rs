//! Streaming calls. A [`MeteredStream`] re-yields upstream chunks while the
//! gateway keeps the job's in-flight slot; the books are settled exactly once,
//! when the stream ends, fails, or is dropped.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt, stream};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::UpstreamError;
use crate::pipeline::{Pipeline, RunningJob};

/// Usage metadata carried by streaming chunks.
///
/// Providers that report cumulative token usage surface it here; the last
/// reported value becomes the call's observed token count at settlement.
/// Chunks without usage return `None`.
pub trait ChunkUsage {
    fn usage_tokens(&self) -> Option<u64>;
}

/// A stream of upstream chunks with gateway accounting attached.
///
/// Yields exactly what the upstream yields, except that a mid-stream error
/// ends the stream after it is surfaced. Dropping the stream before the end
/// releases the in-flight slot in the background and counts as an abort.
pub struct MeteredStream<C> {
    inner: BoxStream<'static, Result<C, UpstreamError>>,
}

impl<C> MeteredStream<C>
where
    C: ChunkUsage + Send + 'static,
{
    /// A stream whose upstream ended before the first chunk. The call has
    /// already been settled; this yields nothing.
    pub(crate) fn finished() -> Self {
        Self {
            inner: stream::empty().boxed(),
        }
    }

    pub(crate) fn open<S>(upstream: Pin<Box<S>>, first: C, finalizer: StreamFinalizer) -> Self
    where
        S: Stream<Item = Result<C, UpstreamError>> + Send + 'static,
    {
        let state = StreamState {
            upstream,
            pending: Some(first),
            finalizer: Some(finalizer),
            observed_tokens: None,
            done: false,
        };
        let inner = stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            if let Some(first) = state.pending.take() {
                state.observe(&first);
                return Some((Ok(first), state));
            }
            match state.upstream.next().await {
                Some(Ok(chunk)) => {
                    state.observe(&chunk);
                    Some((Ok(chunk), state))
                }
                Some(Err(error)) => {
                    if let Some(finalizer) = state.finalizer.take() {
                        finalizer.fail(&error).await;
                    }
                    state.done = true;
                    Some((Err(error), state))
                }
                None => {
                    if let Some(finalizer) = state.finalizer.take() {
                        finalizer.succeed(state.observed_tokens).await;
                    }
                    None
                }
            }
        });
        Self {
            inner: inner.boxed(),
        }
    }
}

impl<C> Stream for MeteredStream<C> {
    type Item = Result<C, UpstreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

struct StreamState<C, S> {
    upstream: Pin<Box<S>>,
    pending: Option<C>,
    finalizer: Option<StreamFinalizer>,
    observed_tokens: Option<u64>,
    done: bool,
}

impl<C: ChunkUsage, S> StreamState<C, S> {
    fn observe(&mut self, chunk: &C) {
        if let Some(tokens) = chunk.usage_tokens() {
            self.observed_tokens = Some(tokens);
        }
    }
}

/// Settles the job behind a stream. Consumed by the clean end and failure
/// paths; dropped unconsumed when the consumer walks away.
pub(crate) struct StreamFinalizer {
    pipeline: Arc<Pipeline>,
    running: Option<RunningJob>,
    started: Instant,
    finished: bool,
}

impl StreamFinalizer {
    pub(crate) fn new(
        pipeline: Arc<Pipeline>,
        running: Option<RunningJob>,
        started: Instant,
    ) -> Self {
        Self {
            pipeline,
            running,
            started,
            finished: false,
        }
    }

    async fn succeed(mut self, observed_tokens: Option<u64>) {
        self.finished = true;
        let latency_ms = self.started.elapsed().as_millis() as u64;
        if let Some(running) = self.running.take() {
            info!(
                job_id = %running.job_id(),
                model = %running.model(),
                latency_ms,
                tokens = observed_tokens,
                "stream completed"
            );
            self.pipeline
                .settle_success(running, latency_ms, observed_tokens)
                .await;
        }
        self.pipeline.metrics.record_completion();
    }

    async fn fail(mut self, error: &UpstreamError) {
        self.finished = true;
        if let Some(running) = self.running.take() {
            warn!(
                job_id = %running.job_id(),
                model = %running.model(),
                error = %error,
                "stream failed mid-flight"
            );
            self.pipeline.settle_failure(running).await;
        }
        self.pipeline.metrics.record_upstream_error();
    }
}

impl Drop for StreamFinalizer {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.pipeline.metrics.record_stream_aborted();
        if let Some(running) = self.running.take() {
            debug!(
                job_id = %running.job_id(),
                model = %running.model(),
                "stream dropped before completion"
            );
            // Dropping the job hands cleanup to a background task.
            drop(running);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::estimate::HeuristicEstimator;
    use crate::store::SharedStore;
    use crate::store::memory::MemoryStore;

    struct Chunk(Option<u64>);

    impl ChunkUsage for Chunk {
        fn usage_tokens(&self) -> Option<u64> {
            self.0
        }
    }

    fn test_pipeline() -> Arc<Pipeline> {
        let config = Arc::new(GatewayConfig::default());
        let store = Arc::new(MemoryStore::new()) as Arc<dyn SharedStore>;
        let estimator = Arc::new(HeuristicEstimator::new(config.default_est_tokens));
        Arc::new(Pipeline::new(config, store, estimator))
    }

    #[tokio::test]
    async fn relays_the_first_chunk_then_the_rest() {
        let pipeline = test_pipeline();
        let finalizer = StreamFinalizer::new(pipeline.clone(), None, Instant::now());
        let upstream = Box::pin(stream::iter(vec![
            Ok(Chunk(None)),
            Ok(Chunk(Some(42))),
        ]));

        let mut metered = MeteredStream::open(upstream, Chunk(None), finalizer);
        let mut seen = 0;
        while let Some(item) = metered.next().await {
            assert!(item.is_ok());
            seen += 1;
        }
        assert_eq!(seen, 3);
        assert_eq!(pipeline.metrics.snapshot().completions, 1);
        assert_eq!(pipeline.metrics.snapshot().streams_aborted, 0);
    }

    #[tokio::test]
    async fn a_mid_stream_error_is_surfaced_then_ends_the_stream() {
        let pipeline = test_pipeline();
        let finalizer = StreamFinalizer::new(pipeline.clone(), None, Instant::now());
        let upstream = Box::pin(stream::iter(vec![
            Ok(Chunk(None)),
            Err(UpstreamError::network("connection reset")),
            Ok(Chunk(None)),
        ]));

        let mut metered = MeteredStream::open(upstream, Chunk(None), finalizer);
        assert!(metered.next().await.is_some_and(|item| item.is_ok()));
        assert!(metered.next().await.is_some_and(|item| item.is_ok()));
        assert!(metered.next().await.is_some_and(|item| item.is_err()));
        // The chunk after the error is never yielded.
        assert!(metered.next().await.is_none());

        let snapshot = pipeline.metrics.snapshot();
        assert_eq!(snapshot.upstream_errors, 1);
        assert_eq!(snapshot.completions, 0);
    }

    #[tokio::test]
    async fn dropping_the_stream_counts_as_an_abort() {
        let pipeline = test_pipeline();
        let finalizer = StreamFinalizer::new(pipeline.clone(), None, Instant::now());
        let upstream = Box::pin(stream::pending::<Result<Chunk, UpstreamError>>());

        let mut metered = MeteredStream::open(upstream, Chunk(None), finalizer);
        assert!(metered.next().await.is_some_and(|item| item.is_ok()));
        drop(metered);

        let snapshot = pipeline.metrics.snapshot();
        assert_eq!(snapshot.streams_aborted, 1);
        assert_eq!(snapshot.completions, 0);
    }

    #[tokio::test]
    async fn an_exhausted_stream_reports_the_last_observed_usage() {
        let pipeline = test_pipeline();
        let finalizer = StreamFinalizer::new(pipeline.clone(), None, Instant::now());
        let upstream = Box::pin(stream::iter(vec![
            Ok(Chunk(Some(10))),
            Ok(Chunk(None)),
            Ok(Chunk(Some(37))),
        ]));

        let mut metered = MeteredStream::open(upstream, Chunk(None), finalizer);
        while metered.next().await.is_some() {}
        // Settlement ran with tokens = 37; without a metered job that only
        // shows up as a completion.
        assert_eq!(pipeline.metrics.snapshot().completions, 1);
    }
}
