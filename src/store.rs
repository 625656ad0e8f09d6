//! Shared scheduling state. Every cross-replica truth (queues, pacers,
//! permits, leases, stats) lives behind [`SharedStore`]; each method is one
//! atomic operation and all time arithmetic uses the store's clock, never the
//! caller's.

pub mod memory;
#[cfg(feature = "store-redis")]
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{RateLimitKind, StoreError};

/// Millisecond wall clock. The seam exists so the in-memory store can run on
/// virtual time in tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that follows `tokio::time`, so paused-runtime tests advance it with
/// `tokio::time::advance` / auto-advance. Pinned to a fixed epoch offset to
/// keep timestamps wall-clock shaped.
#[derive(Debug)]
pub struct VirtualClock {
    start: tokio::time::Instant,
    origin_ms: u64,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            start: tokio::time::Instant::now(),
            origin_ms: 1_700_000_000_000,
        }
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> u64 {
        self.origin_ms + self.start.elapsed().as_millis() as u64
    }
}

/// One pending call, as stored in the job hash. `enqueued_at_ms` is stamped by
/// the store on write; the value supplied by the client is ignored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobRecord {
    pub job_id: String,
    pub model: String,
    pub user_id: String,
    pub route: String,
    pub estimated_tokens: u64,
    pub attempt: u32,
    pub enqueued_at_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedJob {
    pub user_id: String,
    pub job_id: String,
}

/// Scheduler-to-client rendezvous value: either a granted start time or a
/// quota denial the client should surface.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Permit {
    Start { start_at_ms: u64 },
    Denied {
        kind: RateLimitKind,
        retry_after_ms: u64,
    },
}

impl Permit {
    pub fn encode(&self) -> String {
        match self {
            Permit::Start { start_at_ms } => start_at_ms.to_string(),
            Permit::Denied {
                kind,
                retry_after_ms,
            } => format!("denied:{}:{retry_after_ms}", kind.as_str()),
        }
    }

    pub fn decode(raw: &str) -> Result<Self, StoreError> {
        if let Some(rest) = raw.strip_prefix("denied:") {
            let (tag, after) = rest.split_once(':').ok_or_else(|| {
                StoreError::Malformed(format!("permit denial missing delay: {raw}"))
            })?;
            let kind = RateLimitKind::from_tag(tag).ok_or_else(|| {
                StoreError::Malformed(format!("unknown permit denial kind: {tag}"))
            })?;
            let retry_after_ms = after
                .parse::<u64>()
                .map_err(|_| StoreError::Malformed(format!("bad permit delay: {after}")))?;
            return Ok(Permit::Denied {
                kind,
                retry_after_ms,
            });
        }
        let start_at_ms = raw
            .parse::<u64>()
            .map_err(|_| StoreError::Malformed(format!("bad permit value: {raw}")))?;
        Ok(Permit::Start { start_at_ms })
    }
}

/// Outcome of a daily-quota reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DaySlot {
    Reserved { start_at_ms: u64 },
    Denied { retry_after_ms: u64 },
}

/// Outcome of an RPM/TPM start reservation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StartDecision {
    Start { start_at_ms: u64 },
    Denied {
        kind: RateLimitKind,
        retry_after_ms: u64,
    },
}

/// Read-only view of one model's pacer state, for operators and tests.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct PacerSnapshot {
    pub next_rpm_ms: u64,
    pub next_tpm_ms: u64,
    pub day_count: u64,
}

/// Atomic scheduling primitives shared by every replica. Implementations must
/// make each method a single atomic step against their backend; callers never
/// compose read-then-write sequences across methods for correctness.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Store-side wall clock in milliseconds.
    async fn now_ms(&self) -> Result<u64, StoreError>;

    /// Idempotently enqueue one attempt: writes the job hash, pushes the job
    /// onto its user's queue (head when `attempt > 0`, tail otherwise), marks
    /// the user active, and clears any stale permit/scheduled state from a
    /// previous attempt. Returns false when this attempt was already enqueued.
    async fn enqueue_job(&self, job: &JobRecord, ttl_ms: u64) -> Result<bool, StoreError>;

    /// Round-robin pop: advances the persistent cursor across the
    /// lexicographically ordered active users and pops the head of the chosen
    /// user's queue. Returns `None` when no user has queued work.
    async fn dequeue_next(&self, model: &str) -> Result<Option<QueuedJob>, StoreError>;

    async fn read_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Remove a still-queued job (cancellation before the scheduler popped it)
    /// and deactivate the user when their queue empties.
    async fn abandon_queued(
        &self,
        model: &str,
        user_id: &str,
        job_id: &str,
    ) -> Result<(), StoreError>;

    /// Delete the job hash, permit, scheduled flag, and this attempt's enqueue
    /// flag.
    async fn clear_job(&self, job_id: &str, attempt: u32) -> Result<(), StoreError>;

    /// Duplicate-permit defence: `SET NX PX`. False means the job is already
    /// scheduled and the caller must skip.
    async fn mark_scheduled(&self, job_id: &str, ttl_ms: u64) -> Result<bool, StoreError>;

    async fn write_permit(
        &self,
        job_id: &str,
        permit: &Permit,
        ttl_ms: u64,
    ) -> Result<(), StoreError>;

    async fn read_permit(&self, job_id: &str) -> Result<Option<Permit>, StoreError>;

    /// Reserve a daily slot inside the trailing 24 h window. Slots that would
    /// start beyond `horizon_ms` from now are denied without being written.
    async fn reserve_day_slot(
        &self,
        model: &str,
        job_id: &str,
        rpd: u64,
        horizon_ms: u64,
    ) -> Result<DaySlot, StoreError>;

    async fn release_day_slot(&self, model: &str, job_id: &str) -> Result<(), StoreError>;

    /// GCRA reservation against both pacers:
    /// `start = max(now, next_rpm, next_tpm, floor_ms)`, then both pacers
    /// advance by their intervals. Starts beyond `horizon_ms` are denied and
    /// nothing advances.
    async fn reserve_start(
        &self,
        model: &str,
        rpm_interval_ms: u64,
        tpm_interval_ms: u64,
        floor_ms: u64,
        horizon_ms: u64,
    ) -> Result<StartDecision, StoreError>;

    /// Reconciliation: shift the TPM pacer by the observed-vs-estimated delta,
    /// clamped so it never recedes behind `now`.
    async fn shift_tpm_pacer(&self, model: &str, delta_ms: i64) -> Result<(), StoreError>;

    /// Drop in-flight entries whose self-eviction score has passed. Returns
    /// how many were removed.
    async fn prune_running(&self, model: &str) -> Result<u64, StoreError>;

    async fn running_count(&self, model: &str) -> Result<u64, StoreError>;

    /// Claim an in-flight slot unless the set is already at `limit`.
    async fn try_begin_running(
        &self,
        model: &str,
        job_id: &str,
        limit: u64,
        evict_at_ms: u64,
    ) -> Result<bool, StoreError>;

    async fn end_running(&self, model: &str, job_id: &str) -> Result<(), StoreError>;

    /// Scheduler lease: `SET NX PX`.
    async fn acquire_lease(&self, model: &str, holder: &str, ttl_ms: u64)
    -> Result<bool, StoreError>;

    /// Compare-and-swap renewal; false means the lease belongs to someone else
    /// (or lapsed) and the holder must yield.
    async fn renew_lease(&self, model: &str, holder: &str, ttl_ms: u64)
    -> Result<bool, StoreError>;

    async fn release_lease(&self, model: &str, holder: &str) -> Result<(), StoreError>;

    /// Push one completed call into the rolling stats lists (latency, tokens,
    /// per-route tokens), trimming each to `window`, newest first.
    async fn record_call(
        &self,
        model: &str,
        route: &str,
        latency_ms: u64,
        tokens: u64,
        window: usize,
    ) -> Result<(), StoreError>;

    async fn latency_samples(&self, model: &str, window: usize) -> Result<Vec<u64>, StoreError>;

    async fn token_samples(&self, model: &str, window: usize) -> Result<Vec<u64>, StoreError>;

    async fn route_token_samples(
        &self,
        model: &str,
        route: &str,
        window: usize,
    ) -> Result<Vec<u64>, StoreError>;

    async fn queue_depth(&self, model: &str, user_id: &str) -> Result<u64, StoreError>;

    async fn active_users(&self, model: &str) -> Result<Vec<String>, StoreError>;

    async fn pacer_snapshot(&self, model: &str) -> Result<PacerSnapshot, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permit_values_round_trip_through_the_wire_form() {
        let grant = Permit::Start {
            start_at_ms: 1_700_000_123_456,
        };
        assert_eq!(Permit::decode(&grant.encode()).unwrap(), grant);

        let denial = Permit::Denied {
            kind: RateLimitKind::Rpd,
            retry_after_ms: 86_400_000,
        };
        assert_eq!(denial.encode(), "denied:rpd:86400000");
        assert_eq!(Permit::decode(&denial.encode()).unwrap(), denial);
    }

    #[test]
    fn malformed_permit_values_are_rejected() {
        assert!(Permit::decode("not-a-number").is_err());
        assert!(Permit::decode("denied:rpd").is_err());
        assert!(Permit::decode("denied:nope:5").is_err());
        assert!(Permit::decode("denied:rpm:abc").is_err());
    }
}
