//! Streaming calls through the gateway: chunk relay, settlement from
//! provider-reported usage, retries up to the first chunk, and slot release
//! when the consumer walks away early.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{StreamExt, stream};
use serde_json::json;

use tollgate::store::memory::MemoryStore;
use tollgate::store::{SharedStore, VirtualClock};
use tollgate::{
    CallRequest, ChunkUsage, Gateway, GatewayConfig, LimitsConfig, LimitsEntry, UpstreamError,
};

#[derive(Debug)]
struct Chunk {
    text: &'static str,
    usage: Option<u64>,
}

impl Chunk {
    fn text(text: &'static str) -> Self {
        Self { text, usage: None }
    }

    fn usage(text: &'static str, tokens: u64) -> Self {
        Self {
            text,
            usage: Some(tokens),
        }
    }
}

impl ChunkUsage for Chunk {
    fn usage_tokens(&self) -> Option<u64> {
        self.usage
    }
}

fn base_config() -> GatewayConfig {
    GatewayConfig {
        scheduler_poll_ms: 10,
        jitter_max_ms: 0,
        limits: LimitsConfig {
            fallback: Some(LimitsEntry {
                rpm: 600,
                tpm: 10_000_000,
                rpd: 100_000,
                tpm_burst: None,
            }),
            ..LimitsConfig::default()
        },
        ..GatewayConfig::default()
    }
}

fn memory_gateway() -> (Gateway, Arc<MemoryStore>) {
    let memory = Arc::new(MemoryStore::with_clock(Arc::new(VirtualClock::new())));
    let store: Arc<dyn SharedStore> = memory.clone();
    (Gateway::new(base_config(), store).unwrap(), memory)
}

fn chat_request() -> CallRequest {
    CallRequest::new("acme/chat", json!({}))
        .with_user("solo")
        .with_route("chat")
        .with_completion_tokens_hint(9_000)
}

#[tokio::test(start_paused = true)]
async fn a_stream_relays_chunks_and_settles_with_reported_usage() {
    let (gateway, _memory) = memory_gateway();

    let mut metered = gateway
        .stream(chat_request(), |_attempt| async move {
            Ok::<_, UpstreamError>(stream::iter(vec![
                Ok(Chunk::text("he")),
                Ok(Chunk::text("llo")),
                Ok(Chunk::usage("", 5_000)),
            ]))
        })
        .await
        .unwrap();

    let mut text = String::new();
    while let Some(chunk) = metered.next().await {
        text.push_str(chunk.unwrap().text);
    }
    assert_eq!(text, "hello");

    let metrics = gateway.metrics();
    assert_eq!(metrics.streams_opened, 1);
    assert_eq!(metrics.completions, 1);
    assert_eq!(metrics.streams_aborted, 0);

    // The provider-reported 5k, not the 9k hint, lands in the stats window.
    // The aggregate cache was primed empty during admission, so let it lapse.
    tokio::time::sleep(Duration::from_secs(6)).await;
    let usage = gateway.usage("acme/chat").await.unwrap();
    assert_eq!(usage.samples, 1);
    assert_eq!(usage.mean_tokens, Some(5_000.0));
    assert_eq!(usage.in_flight, 0);

    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn opening_a_stream_retries_until_the_first_chunk() {
    let (gateway, _memory) = memory_gateway();

    // The first attempt dies before yielding a chunk; that is still within
    // the retry window.
    let mut metered = gateway
        .stream(chat_request(), |attempt| async move {
            if attempt == 0 {
                Ok::<_, UpstreamError>(stream::iter(vec![Err(UpstreamError::network(
                    "connection reset",
                ))]))
            } else {
                Ok(stream::iter(vec![Ok(Chunk::usage("done", 100))]))
            }
        })
        .await
        .unwrap();

    let mut chunks = 0;
    while let Some(chunk) = metered.next().await {
        assert!(chunk.is_ok());
        chunks += 1;
    }
    assert_eq!(chunks, 1);

    let metrics = gateway.metrics();
    assert_eq!(metrics.retries, 1);
    assert_eq!(metrics.upstream_errors, 1);
    assert_eq!(metrics.streams_opened, 1);
    assert_eq!(metrics.completions, 1);

    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn a_mid_stream_failure_is_yielded_not_retried() {
    let (gateway, memory) = memory_gateway();

    let mut metered = gateway
        .stream(chat_request(), |_attempt| async move {
            Ok::<_, UpstreamError>(stream::iter(vec![
                Ok(Chunk::text("partial")),
                Err(UpstreamError::network("connection reset")),
            ]))
        })
        .await
        .unwrap();

    assert!(metered.next().await.is_some_and(|chunk| chunk.is_ok()));
    match metered.next().await {
        Some(Err(UpstreamError::Network { .. })) => {}
        other => panic!("expected the network error, got {other:?}"),
    }
    assert!(metered.next().await.is_none());

    let metrics = gateway.metrics();
    assert_eq!(metrics.retries, 0);
    assert_eq!(metrics.upstream_errors, 1);
    assert_eq!(metrics.streams_opened, 1);
    assert_eq!(metrics.completions, 0);
    // The failure settled the books, so the in-flight slot is free again.
    assert_eq!(memory.running_count("acme/chat").await.unwrap(), 0);

    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn dropping_a_stream_releases_the_slot_in_the_background() {
    let (gateway, memory) = memory_gateway();

    let mut metered = gateway
        .stream(chat_request(), |_attempt| async move {
            Ok::<_, UpstreamError>(
                stream::iter(vec![Ok(Chunk::text("first"))]).chain(stream::pending()),
            )
        })
        .await
        .unwrap();

    assert!(metered.next().await.is_some_and(|chunk| chunk.is_ok()));
    assert_eq!(memory.running_count("acme/chat").await.unwrap(), 1);

    drop(metered);
    // Cleanup runs on a spawned task.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let metrics = gateway.metrics();
    assert_eq!(metrics.streams_aborted, 1);
    assert_eq!(metrics.completions, 0);
    assert_eq!(memory.running_count("acme/chat").await.unwrap(), 0);

    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn an_empty_upstream_settles_before_any_chunk() {
    let (gateway, memory) = memory_gateway();

    let mut metered = gateway
        .stream(chat_request(), |_attempt| async move {
            Ok::<_, UpstreamError>(stream::iter(
                Vec::<Result<Chunk, UpstreamError>>::new(),
            ))
        })
        .await
        .unwrap();
    assert!(metered.next().await.is_none());

    let metrics = gateway.metrics();
    assert_eq!(metrics.completions, 1);
    assert_eq!(metrics.streams_opened, 0);
    assert_eq!(metrics.streams_aborted, 0);
    assert_eq!(memory.running_count("acme/chat").await.unwrap(), 0);

    gateway.shutdown().await;
}
