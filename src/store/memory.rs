use std::collections::{BTreeSet, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::{RateLimitKind, StoreError};

use super::{
    Clock, DaySlot, JobRecord, PacerSnapshot, Permit, QueuedJob, SharedStore, StartDecision,
    SystemClock,
};

const DAY_WINDOW_MS: u64 = 86_400_000;
const SWEEP_INTERVAL_MS: u64 = 1_000;

/// In-process [`SharedStore`]: the same contract as the Redis store, guarded
/// by one mutex. Suitable for single-replica deployments and the test suite;
/// state does not survive the process.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<String, Expiring<JobRecord>>,
    enqueued: HashMap<String, u64>,
    queues: HashMap<(String, String), VecDeque<String>>,
    active: HashMap<String, BTreeSet<String>>,
    cursors: HashMap<String, String>,
    permits: HashMap<String, Expiring<Permit>>,
    scheduled: HashMap<String, u64>,
    running: HashMap<String, HashMap<String, u64>>,
    next_rpm: HashMap<String, u64>,
    next_tpm: HashMap<String, u64>,
    day_log: HashMap<String, Vec<(String, u64)>>,
    leases: HashMap<String, (String, u64)>,
    latencies: HashMap<String, VecDeque<u64>>,
    tokens: HashMap<String, VecDeque<u64>>,
    route_tokens: HashMap<(String, String), VecDeque<u64>>,
    next_sweep_ms: u64,
}

struct Expiring<T> {
    value: T,
    expires_at_ms: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn enqueue_flag(job_id: &str, attempt: u32) -> String {
    format!("{job_id}:{attempt}")
}

fn deactivate_user(state: &mut MemoryState, model: &str, user: &str) {
    if let Some(users) = state.active.get_mut(model) {
        users.remove(user);
        if users.is_empty() {
            state.active.remove(model);
        }
    }
}

fn prune_running_entries(state: &mut MemoryState, model: &str, now: u64) -> u64 {
    let Some(running) = state.running.get_mut(model) else {
        return 0;
    };
    let before = running.len();
    running.retain(|_, evict_at| *evict_at > now);
    (before - running.len()) as u64
}

fn trim_day_log(state: &mut MemoryState, model: &str, now: u64) {
    if let Some(log) = state.day_log.get_mut(model) {
        log.retain(|(_, ts)| ts.saturating_add(DAY_WINDOW_MS) > now);
    }
}

// The Redis store expires job, flag, permit, and scheduled keys by TTL.
// Point reads here already treat lapsed entries as absent; this removes
// them so abandoned jobs do not accumulate.
fn sweep_lapsed_keys(state: &mut MemoryState, now: u64) {
    state.jobs.retain(|_, entry| entry.expires_at_ms > now);
    state.enqueued.retain(|_, exp| *exp > now);
    state.permits.retain(|_, entry| entry.expires_at_ms > now);
    state.scheduled.retain(|_, exp| *exp > now);
}

fn push_sample(samples: &mut VecDeque<u64>, value: u64, window: usize) {
    samples.push_front(value);
    samples.truncate(window.max(1));
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn now_ms(&self) -> Result<u64, StoreError> {
        Ok(self.clock.now_ms())
    }

    async fn enqueue_job(&self, job: &JobRecord, ttl_ms: u64) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.lock();

        if now >= state.next_sweep_ms {
            sweep_lapsed_keys(&mut state, now);
            state.next_sweep_ms = now + SWEEP_INTERVAL_MS;
        }

        let flag = enqueue_flag(&job.job_id, job.attempt);
        if state.enqueued.get(&flag).is_some_and(|exp| *exp > now) {
            return Ok(false);
        }
        state.enqueued.insert(flag, now + ttl_ms);

        // A fresh attempt invalidates any rendezvous state left from the last
        // one; the scheduler must be able to issue a new permit.
        state.permits.remove(&job.job_id);
        state.scheduled.remove(&job.job_id);

        let mut record = job.clone();
        record.enqueued_at_ms = now;
        state.jobs.insert(
            job.job_id.clone(),
            Expiring {
                value: record,
                expires_at_ms: now + ttl_ms,
            },
        );

        let queue = state
            .queues
            .entry((job.model.clone(), job.user_id.clone()))
            .or_default();
        if job.attempt > 0 {
            queue.push_front(job.job_id.clone());
        } else {
            queue.push_back(job.job_id.clone());
        }
        state
            .active
            .entry(job.model.clone())
            .or_default()
            .insert(job.user_id.clone());
        Ok(true)
    }

    async fn dequeue_next(&self, model: &str) -> Result<Option<QueuedJob>, StoreError> {
        let mut state = self.lock();
        let mut cursor = state.cursors.get(model).cloned();
        loop {
            let candidate = {
                let Some(users) = state.active.get(model) else {
                    return Ok(None);
                };
                let after = cursor.as_ref().and_then(|c| {
                    users
                        .range::<str, _>((Bound::Excluded(c.as_str()), Bound::Unbounded))
                        .next()
                        .cloned()
                });
                match after.or_else(|| users.first().cloned()) {
                    Some(user) => user,
                    None => return Ok(None),
                }
            };

            let queue_key = (model.to_string(), candidate.clone());
            if let Some(job_id) = state
                .queues
                .get_mut(&queue_key)
                .and_then(|queue| queue.pop_front())
            {
                if state
                    .queues
                    .get(&queue_key)
                    .is_none_or(|queue| queue.is_empty())
                {
                    state.queues.remove(&queue_key);
                    deactivate_user(&mut state, model, &candidate);
                }
                state.cursors.insert(model.to_string(), candidate.clone());
                return Ok(Some(QueuedJob {
                    user_id: candidate,
                    job_id,
                }));
            }

            // Active user without a queue: repair the invariant, keep scanning.
            deactivate_user(&mut state, model, &candidate);
            cursor = Some(candidate);
        }
    }

    async fn read_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let now = self.clock.now_ms();
        let state = self.lock();
        Ok(state
            .jobs
            .get(job_id)
            .filter(|entry| entry.expires_at_ms > now)
            .map(|entry| entry.value.clone()))
    }

    async fn abandon_queued(
        &self,
        model: &str,
        user_id: &str,
        job_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let queue_key = (model.to_string(), user_id.to_string());
        if let Some(queue) = state.queues.get_mut(&queue_key) {
            if let Some(position) = queue.iter().position(|id| id == job_id) {
                queue.remove(position);
            }
            if queue.is_empty() {
                state.queues.remove(&queue_key);
                deactivate_user(&mut state, model, user_id);
            }
        }
        Ok(())
    }

    async fn clear_job(&self, job_id: &str, attempt: u32) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.jobs.remove(job_id);
        state.permits.remove(job_id);
        state.scheduled.remove(job_id);
        state.enqueued.remove(&enqueue_flag(job_id, attempt));
        Ok(())
    }

    async fn mark_scheduled(&self, job_id: &str, ttl_ms: u64) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        if state.scheduled.get(job_id).is_some_and(|exp| *exp > now) {
            return Ok(false);
        }
        state.scheduled.insert(job_id.to_string(), now + ttl_ms);
        Ok(true)
    }

    async fn write_permit(
        &self,
        job_id: &str,
        permit: &Permit,
        ttl_ms: u64,
    ) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        state.permits.insert(
            job_id.to_string(),
            Expiring {
                value: *permit,
                expires_at_ms: now + ttl_ms,
            },
        );
        Ok(())
    }

    async fn read_permit(&self, job_id: &str) -> Result<Option<Permit>, StoreError> {
        let now = self.clock.now_ms();
        let state = self.lock();
        Ok(state
            .permits
            .get(job_id)
            .filter(|entry| entry.expires_at_ms > now)
            .map(|entry| entry.value))
    }

    async fn reserve_day_slot(
        &self,
        model: &str,
        job_id: &str,
        rpd: u64,
        horizon_ms: u64,
    ) -> Result<DaySlot, StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        trim_day_log(&mut state, model, now);

        let log = state.day_log.entry(model.to_string()).or_default();
        let start_at_ms = if (log.len() as u64) < rpd {
            now
        } else {
            let oldest = log.iter().map(|(_, ts)| *ts).min().unwrap_or(now);
            oldest + DAY_WINDOW_MS
        };

        let delay = start_at_ms.saturating_sub(now);
        if delay > horizon_ms {
            return Ok(DaySlot::Denied {
                retry_after_ms: delay,
            });
        }
        log.push((job_id.to_string(), start_at_ms));
        Ok(DaySlot::Reserved { start_at_ms })
    }

    async fn release_day_slot(&self, model: &str, job_id: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(log) = state.day_log.get_mut(model) {
            log.retain(|(id, _)| id != job_id);
        }
        Ok(())
    }

    async fn reserve_start(
        &self,
        model: &str,
        rpm_interval_ms: u64,
        tpm_interval_ms: u64,
        floor_ms: u64,
        horizon_ms: u64,
    ) -> Result<StartDecision, StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        let next_rpm = state.next_rpm.get(model).copied().unwrap_or(0);
        let next_tpm = state.next_tpm.get(model).copied().unwrap_or(0);
        let start_at_ms = now.max(next_rpm).max(next_tpm).max(floor_ms);

        let delay = start_at_ms - now;
        if delay > horizon_ms {
            let kind = if next_tpm > next_rpm {
                RateLimitKind::Tpm
            } else {
                RateLimitKind::Rpm
            };
            return Ok(StartDecision::Denied {
                kind,
                retry_after_ms: delay,
            });
        }

        state
            .next_rpm
            .insert(model.to_string(), start_at_ms + rpm_interval_ms);
        state
            .next_tpm
            .insert(model.to_string(), start_at_ms + tpm_interval_ms);
        Ok(StartDecision::Start { start_at_ms })
    }

    async fn shift_tpm_pacer(&self, model: &str, delta_ms: i64) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        // A lapsed pacer means "free to start now"; shifts apply from there.
        let base = state.next_tpm.get(model).copied().unwrap_or(0).max(now);
        let shifted = if delta_ms >= 0 {
            base.saturating_add(delta_ms as u64)
        } else {
            base.saturating_sub(delta_ms.unsigned_abs())
        };
        state.next_tpm.insert(model.to_string(), shifted.max(now));
        Ok(())
    }

    async fn prune_running(&self, model: &str) -> Result<u64, StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        Ok(prune_running_entries(&mut state, model, now))
    }

    async fn running_count(&self, model: &str) -> Result<u64, StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        prune_running_entries(&mut state, model, now);
        Ok(state.running.get(model).map(|set| set.len()).unwrap_or(0) as u64)
    }

    async fn try_begin_running(
        &self,
        model: &str,
        job_id: &str,
        limit: u64,
        evict_at_ms: u64,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        prune_running_entries(&mut state, model, now);
        let running = state.running.entry(model.to_string()).or_default();
        if (running.len() as u64) >= limit {
            return Ok(false);
        }
        running.insert(job_id.to_string(), evict_at_ms);
        Ok(true)
    }

    async fn end_running(&self, model: &str, job_id: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(running) = state.running.get_mut(model) {
            running.remove(job_id);
            if running.is_empty() {
                state.running.remove(model);
            }
        }
        Ok(())
    }

    async fn acquire_lease(
        &self,
        model: &str,
        holder: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        if state
            .leases
            .get(model)
            .is_some_and(|(_, expires)| *expires > now)
        {
            return Ok(false);
        }
        state
            .leases
            .insert(model.to_string(), (holder.to_string(), now + ttl_ms));
        Ok(true)
    }

    async fn renew_lease(
        &self,
        model: &str,
        holder: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        match state.leases.get_mut(model) {
            Some((owner, expires)) if owner == holder && *expires > now => {
                *expires = now + ttl_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, model: &str, holder: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state
            .leases
            .get(model)
            .is_some_and(|(owner, _)| owner == holder)
        {
            state.leases.remove(model);
        }
        Ok(())
    }

    async fn record_call(
        &self,
        model: &str,
        route: &str,
        latency_ms: u64,
        tokens: u64,
        window: usize,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        push_sample(
            state.latencies.entry(model.to_string()).or_default(),
            latency_ms,
            window,
        );
        push_sample(
            state.tokens.entry(model.to_string()).or_default(),
            tokens,
            window,
        );
        push_sample(
            state
                .route_tokens
                .entry((model.to_string(), route.to_string()))
                .or_default(),
            tokens,
            window,
        );
        Ok(())
    }

    async fn latency_samples(&self, model: &str, window: usize) -> Result<Vec<u64>, StoreError> {
        let state = self.lock();
        Ok(state
            .latencies
            .get(model)
            .map(|samples| samples.iter().take(window).copied().collect())
            .unwrap_or_default())
    }

    async fn token_samples(&self, model: &str, window: usize) -> Result<Vec<u64>, StoreError> {
        let state = self.lock();
        Ok(state
            .tokens
            .get(model)
            .map(|samples| samples.iter().take(window).copied().collect())
            .unwrap_or_default())
    }

    async fn route_token_samples(
        &self,
        model: &str,
        route: &str,
        window: usize,
    ) -> Result<Vec<u64>, StoreError> {
        let state = self.lock();
        Ok(state
            .route_tokens
            .get(&(model.to_string(), route.to_string()))
            .map(|samples| samples.iter().take(window).copied().collect())
            .unwrap_or_default())
    }

    async fn queue_depth(&self, model: &str, user_id: &str) -> Result<u64, StoreError> {
        let state = self.lock();
        Ok(state
            .queues
            .get(&(model.to_string(), user_id.to_string()))
            .map(|queue| queue.len())
            .unwrap_or(0) as u64)
    }

    async fn active_users(&self, model: &str) -> Result<Vec<String>, StoreError> {
        let state = self.lock();
        Ok(state
            .active
            .get(model)
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn pacer_snapshot(&self, model: &str) -> Result<PacerSnapshot, StoreError> {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        trim_day_log(&mut state, model, now);
        Ok(PacerSnapshot {
            next_rpm_ms: state.next_rpm.get(model).copied().unwrap_or(0),
            next_tpm_ms: state.next_tpm.get(model).copied().unwrap_or(0),
            day_count: state.day_log.get(model).map(|log| log.len()).unwrap_or(0) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FixedClock(AtomicU64);

    impl FixedClock {
        fn at(ms: u64) -> Arc<Self> {
            Arc::new(Self(AtomicU64::new(ms)))
        }

        fn advance(&self, ms: u64) {
            self.0.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Clock for FixedClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn job(model: &str, user: &str, id: &str) -> JobRecord {
        JobRecord {
            job_id: id.to_string(),
            model: model.to_string(),
            user_id: user.to_string(),
            route: "default".to_string(),
            estimated_tokens: 100,
            attempt: 0,
            enqueued_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn round_robin_rotates_lexicographically_and_wraps() {
        let store = MemoryStore::new();
        let model = "acme/m";
        store.enqueue_job(&job(model, "alpha", "a1"), 60_000).await.unwrap();
        store.enqueue_job(&job(model, "alpha", "a2"), 60_000).await.unwrap();
        store.enqueue_job(&job(model, "gamma", "g1"), 60_000).await.unwrap();
        store.enqueue_job(&job(model, "beta", "b1"), 60_000).await.unwrap();

        let order: Vec<String> = {
            let mut out = Vec::new();
            while let Some(popped) = store.dequeue_next(model).await.unwrap() {
                out.push(popped.job_id);
            }
            out
        };
        assert_eq!(order, vec!["a1", "b1", "g1", "a2"]);
        assert!(store.active_users(model).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_attempt_does_not_enqueue_twice() {
        let store = MemoryStore::new();
        let record = job("acme/m", "user", "j1");
        assert!(store.enqueue_job(&record, 60_000).await.unwrap());
        assert!(!store.enqueue_job(&record, 60_000).await.unwrap());
        assert_eq!(store.queue_depth("acme/m", "user").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn retry_attempt_requeues_at_the_head() {
        let store = MemoryStore::new();
        let model = "acme/m";
        store.enqueue_job(&job(model, "user", "first"), 60_000).await.unwrap();
        store.enqueue_job(&job(model, "user", "second"), 60_000).await.unwrap();

        let mut retry = job(model, "user", "first-retry");
        retry.attempt = 1;
        store.enqueue_job(&retry, 60_000).await.unwrap();

        let popped = store.dequeue_next(model).await.unwrap().unwrap();
        assert_eq!(popped.job_id, "first-retry");
    }

    #[tokio::test]
    async fn day_slots_deny_past_horizon_and_free_on_release() {
        let clock = FixedClock::at(1_000_000);
        let store = MemoryStore::with_clock(clock.clone());
        let model = "acme/m";

        let first = store.reserve_day_slot(model, "j1", 2, 10_000).await.unwrap();
        let second = store.reserve_day_slot(model, "j2", 2, 10_000).await.unwrap();
        assert!(matches!(first, DaySlot::Reserved { start_at_ms } if start_at_ms == 1_000_000));
        assert!(matches!(second, DaySlot::Reserved { .. }));

        let third = store.reserve_day_slot(model, "j3", 2, 10_000).await.unwrap();
        match third {
            DaySlot::Denied { retry_after_ms } => assert_eq!(retry_after_ms, DAY_WINDOW_MS),
            other => panic!("expected denial, got {other:?}"),
        }

        store.release_day_slot(model, "j1").await.unwrap();
        let reclaimed = store.reserve_day_slot(model, "j3", 2, 10_000).await.unwrap();
        assert!(matches!(reclaimed, DaySlot::Reserved { .. }));
    }

    #[tokio::test]
    async fn day_window_expires_old_reservations() {
        let clock = FixedClock::at(1_000_000);
        let store = MemoryStore::with_clock(clock.clone());
        let model = "acme/m";

        store.reserve_day_slot(model, "j1", 1, 10_000).await.unwrap();
        let blocked = store.reserve_day_slot(model, "j2", 1, 10_000).await.unwrap();
        assert!(matches!(blocked, DaySlot::Denied { .. }));

        clock.advance(DAY_WINDOW_MS + 1);
        let freed = store.reserve_day_slot(model, "j2", 1, 10_000).await.unwrap();
        assert!(matches!(freed, DaySlot::Reserved { .. }));
    }

    #[tokio::test]
    async fn start_reservations_space_by_the_widest_interval() {
        let clock = FixedClock::at(500_000);
        let store = MemoryStore::with_clock(clock);
        let model = "acme/m";

        let mut starts = Vec::new();
        for _ in 0..3 {
            match store
                .reserve_start(model, 1_000, 10, 0, u64::MAX)
                .await
                .unwrap()
            {
                StartDecision::Start { start_at_ms } => starts.push(start_at_ms),
                other => panic!("unexpected denial: {other:?}"),
            }
        }
        assert_eq!(starts, vec![500_000, 501_000, 502_000]);
    }

    #[tokio::test]
    async fn start_denial_names_the_dominant_pacer_and_leaves_state_alone() {
        let clock = FixedClock::at(500_000);
        let store = MemoryStore::with_clock(clock);
        let model = "acme/m";

        // First reservation pushes the TPM pacer an hour out.
        let first = store
            .reserve_start(model, 1_000, 3_600_000, 0, u64::MAX)
            .await
            .unwrap();
        assert!(matches!(first, StartDecision::Start { .. }));

        let denied = store
            .reserve_start(model, 1_000, 3_600_000, 0, 60_000)
            .await
            .unwrap();
        match denied {
            StartDecision::Denied {
                kind,
                retry_after_ms,
            } => {
                assert_eq!(kind, RateLimitKind::Tpm);
                assert_eq!(retry_after_ms, 3_600_000);
            }
            other => panic!("expected denial, got {other:?}"),
        }

        // Denial must not advance the pacers.
        let snapshot = store.pacer_snapshot(model).await.unwrap();
        assert_eq!(snapshot.next_tpm_ms, 500_000 + 3_600_000);
    }

    #[tokio::test]
    async fn tpm_shift_moves_forward_and_clamps_at_now() {
        let clock = FixedClock::at(500_000);
        let store = MemoryStore::with_clock(clock);
        let model = "acme/m";

        store
            .reserve_start(model, 1_000, 1_000, 0, u64::MAX)
            .await
            .unwrap();
        store.shift_tpm_pacer(model, 2_000).await.unwrap();
        assert_eq!(store.pacer_snapshot(model).await.unwrap().next_tpm_ms, 503_000);

        // A huge giveback cannot move the pacer into the past.
        store.shift_tpm_pacer(model, -1_000_000).await.unwrap();
        assert_eq!(store.pacer_snapshot(model).await.unwrap().next_tpm_ms, 500_000);
    }

    #[tokio::test]
    async fn lease_is_exclusive_and_renewed_by_cas() {
        let clock = FixedClock::at(100_000);
        let store = MemoryStore::with_clock(clock.clone());
        let model = "acme/m";

        assert!(store.acquire_lease(model, "holder-a", 15_000).await.unwrap());
        assert!(!store.acquire_lease(model, "holder-b", 15_000).await.unwrap());
        assert!(!store.renew_lease(model, "holder-b", 15_000).await.unwrap());
        assert!(store.renew_lease(model, "holder-a", 15_000).await.unwrap());

        // Expiry hands the lease over.
        clock.advance(15_001);
        assert!(!store.renew_lease(model, "holder-a", 15_000).await.unwrap());
        assert!(store.acquire_lease(model, "holder-b", 15_000).await.unwrap());

        store.release_lease(model, "holder-b").await.unwrap();
        assert!(store.acquire_lease(model, "holder-a", 15_000).await.unwrap());
    }

    #[tokio::test]
    async fn in_flight_slots_respect_limit_and_self_evict() {
        let clock = FixedClock::at(100_000);
        let store = MemoryStore::with_clock(clock.clone());
        let model = "acme/m";

        assert!(store.try_begin_running(model, "j1", 2, 220_000).await.unwrap());
        assert!(store.try_begin_running(model, "j2", 2, 220_000).await.unwrap());
        assert!(!store.try_begin_running(model, "j3", 2, 220_000).await.unwrap());
        assert_eq!(store.running_count(model).await.unwrap(), 2);

        store.end_running(model, "j1").await.unwrap();
        assert!(store.try_begin_running(model, "j3", 2, 220_000).await.unwrap());

        // Crashed holders age out by score.
        clock.advance(200_000);
        assert_eq!(store.running_count(model).await.unwrap(), 0);
        assert_eq!(store.prune_running(model).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stats_lists_are_bounded_and_newest_first() {
        let store = MemoryStore::new();
        let model = "acme/m";
        for i in 0..5u64 {
            store.record_call(model, "chat", 100 + i, 1_000 + i, 3).await.unwrap();
        }
        let latencies = store.latency_samples(model, 3).await.unwrap();
        assert_eq!(latencies, vec![104, 103, 102]);
        let tokens = store.token_samples(model, 3).await.unwrap();
        assert_eq!(tokens, vec![1_004, 1_003, 1_002]);
        let route = store.route_token_samples(model, "chat", 3).await.unwrap();
        assert_eq!(route, vec![1_004, 1_003, 1_002]);
        assert!(store
            .route_token_samples(model, "other", 3)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn permits_and_scheduled_flags_expire_and_clear() {
        let clock = FixedClock::at(100_000);
        let store = MemoryStore::with_clock(clock.clone());

        assert!(store.mark_scheduled("j1", 5_000).await.unwrap());
        assert!(!store.mark_scheduled("j1", 5_000).await.unwrap());

        let permit = Permit::Start {
            start_at_ms: 101_000,
        };
        store.write_permit("j1", &permit, 5_000).await.unwrap();
        assert_eq!(store.read_permit("j1").await.unwrap(), Some(permit));

        clock.advance(5_001);
        assert_eq!(store.read_permit("j1").await.unwrap(), None);
        assert!(store.mark_scheduled("j1", 5_000).await.unwrap());

        store.clear_job("j1", 0).await.unwrap();
        assert_eq!(store.read_permit("j1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lapsed_job_keys_are_swept_by_later_enqueues() {
        let clock = FixedClock::at(100_000);
        let store = MemoryStore::with_clock(clock.clone());
        let model = "acme/m";

        // A retried job settles and clears its final flag; the attempt-0
        // flag is left to lapse by TTL.
        store.enqueue_job(&job(model, "user", "j1"), 60_000).await.unwrap();
        store.dequeue_next(model).await.unwrap();
        let mut retry = job(model, "user", "j1");
        retry.attempt = 1;
        store.enqueue_job(&retry, 60_000).await.unwrap();
        store.dequeue_next(model).await.unwrap();
        store.clear_job("j1", 1).await.unwrap();

        // A caller that never came back leaves its job, permit, and
        // scheduled flag behind.
        store.enqueue_job(&job(model, "ghost", "j2"), 60_000).await.unwrap();
        store.dequeue_next(model).await.unwrap();
        store.mark_scheduled("j2", 60_000).await.unwrap();
        let permit = Permit::Start {
            start_at_ms: 160_000,
        };
        store.write_permit("j2", &permit, 60_000).await.unwrap();

        clock.advance(DAY_WINDOW_MS);
        store.enqueue_job(&job(model, "user", "j3"), 60_000).await.unwrap();

        let state = store.state.lock().unwrap();
        assert_eq!(state.enqueued.len(), 1, "only the live flag may remain");
        assert_eq!(state.jobs.len(), 1);
        assert!(state.permits.is_empty());
        assert!(state.scheduled.is_empty());
    }

    #[tokio::test]
    async fn abandon_removes_queued_job_and_deactivates_empty_user() {
        let store = MemoryStore::new();
        let model = "acme/m";
        store.enqueue_job(&job(model, "user", "j1"), 60_000).await.unwrap();
        store.enqueue_job(&job(model, "user", "j2"), 60_000).await.unwrap();

        store.abandon_queued(model, "user", "j1").await.unwrap();
        assert_eq!(store.queue_depth(model, "user").await.unwrap(), 1);
        assert_eq!(store.active_users(model).await.unwrap(), vec!["user"]);

        store.abandon_queued(model, "user", "j2").await.unwrap();
        assert_eq!(store.queue_depth(model, "user").await.unwrap(), 0);
        assert!(store.active_users(model).await.unwrap().is_empty());
    }
}
