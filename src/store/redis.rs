//! Redis-backed [`SharedStore`]. Every multi-step decision runs as a Lua
//! script so replicas never interleave, and scripts read the clock with
//! `TIME` so ordering never depends on replica clocks.

use std::collections::HashMap;

use redis::AsyncCommands;

use crate::error::{RateLimitKind, StoreError};

use super::{
    DaySlot, JobRecord, PacerSnapshot, Permit, QueuedJob, SharedStore, StartDecision,
};

const DAY_WINDOW_MS: u64 = 86_400_000;
const STATS_TTL_MS: i64 = 86_400_000;
// Pacer keys outlive their slot by this much so an idle model self-cleans.
const PACER_SLACK_MS: u64 = 60_000;

#[derive(Clone, Debug)]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "llm".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(format!("{}:__ping__", self.prefix)).await?;
        Ok(())
    }

    fn key_job(&self, job_id: &str) -> String {
        format!("{}:job:{job_id}", self.prefix)
    }

    fn key_enqueued(&self, job_id: &str, attempt: u32) -> String {
        format!("{}:enqueued:{job_id}:{attempt}", self.prefix)
    }

    fn key_queue(&self, model: &str, user_id: &str) -> String {
        format!("{}:queue:{model}:{user_id}", self.prefix)
    }

    fn key_queue_prefix(&self, model: &str) -> String {
        format!("{}:queue:{model}:", self.prefix)
    }

    fn key_active_users(&self, model: &str) -> String {
        format!("{}:active_users:{model}", self.prefix)
    }

    fn key_rr_cursor(&self, model: &str) -> String {
        format!("{}:rr_cursor:{model}", self.prefix)
    }

    fn key_permit(&self, job_id: &str) -> String {
        format!("{}:permit:{job_id}", self.prefix)
    }

    fn key_scheduled(&self, job_id: &str) -> String {
        format!("{}:scheduled:{job_id}", self.prefix)
    }

    fn key_active_jobs(&self, model: &str) -> String {
        format!("{}:active_jobs:{model}", self.prefix)
    }

    fn key_next_rpm(&self, model: &str) -> String {
        format!("{}:next_start_rpm_ms:{model}", self.prefix)
    }

    fn key_next_tpm(&self, model: &str) -> String {
        format!("{}:next_start_tpm_ms:{model}", self.prefix)
    }

    fn key_rpd(&self, model: &str) -> String {
        format!("{}:rpd:{model}", self.prefix)
    }

    fn key_lock(&self, model: &str) -> String {
        format!("{}:scheduler:lock:{model}", self.prefix)
    }

    fn key_latency(&self, model: &str) -> String {
        format!("{}:stats:{model}:latency_ms", self.prefix)
    }

    fn key_tokens(&self, model: &str) -> String {
        format!("{}:stats:{model}:tokens", self.prefix)
    }

    fn key_route_tokens(&self, model: &str, route: &str) -> String {
        format!("{}:stats:{model}:route:{route}:tokens", self.prefix)
    }
}

#[async_trait::async_trait]
impl SharedStore for RedisStore {
    async fn now_ms(&self) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let (secs, micros): (u64, u64) = redis::cmd("TIME").query_async(&mut conn).await?;
        Ok(secs * 1_000 + micros / 1_000)
    }

    async fn enqueue_job(&self, job: &JobRecord, ttl_ms: u64) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;

        let script = redis::Script::new(
            r#"
local flag_key = KEYS[1]
local permit_key = KEYS[2]
local scheduled_key = KEYS[3]
local job_key = KEYS[4]
local queue_key = KEYS[5]
local active_key = KEYS[6]

local ttl_ms = tonumber(ARGV[1]) or 0
local job_id = ARGV[2]
local model = ARGV[3]
local user_id = ARGV[4]
local route = ARGV[5]
local estimated_tokens = ARGV[6]
local attempt = tonumber(ARGV[7]) or 0

if not redis.call("SET", flag_key, "1", "NX", "PX", ttl_ms) then
  return 0
end

redis.call("DEL", permit_key, scheduled_key)

local t = redis.call("TIME")
local now = t[1] * 1000 + math.floor(t[2] / 1000)

redis.call("HSET", job_key,
  "model", model,
  "user_id", user_id,
  "route", route,
  "estimated_tokens", estimated_tokens,
  "attempt", tostring(attempt),
  "enqueued_at_ms", tostring(now))
redis.call("PEXPIRE", job_key, ttl_ms)

if attempt > 0 then
  redis.call("LPUSH", queue_key, job_id)
else
  redis.call("RPUSH", queue_key, job_id)
end
redis.call("ZADD", active_key, 0, user_id)
return 1
"#,
        );

        let accepted: i64 = script
            .key(self.key_enqueued(&job.job_id, job.attempt))
            .key(self.key_permit(&job.job_id))
            .key(self.key_scheduled(&job.job_id))
            .key(self.key_job(&job.job_id))
            .key(self.key_queue(&job.model, &job.user_id))
            .key(self.key_active_users(&job.model))
            .arg(ttl_ms)
            .arg(&job.job_id)
            .arg(&job.model)
            .arg(&job.user_id)
            .arg(&job.route)
            .arg(job.estimated_tokens)
            .arg(job.attempt)
            .invoke_async(&mut conn)
            .await?;
        Ok(accepted == 1)
    }

    async fn dequeue_next(&self, model: &str) -> Result<Option<QueuedJob>, StoreError> {
        let mut conn = self.connection().await?;

        // Queue keys are derived from the popped member, so this store
        // requires a single logical Redis rather than a cluster.
        let script = redis::Script::new(
            r#"
local active_key = KEYS[1]
local cursor_key = KEYS[2]
local queue_prefix = ARGV[1]

local total = redis.call("ZCARD", active_key)
if total == 0 then
  return false
end

local cursor = redis.call("GET", cursor_key)
for _ = 1, total do
  local candidate
  if cursor then
    local after = redis.call("ZRANGEBYLEX", active_key, "(" .. cursor, "+", "LIMIT", 0, 1)
    candidate = after[1]
  end
  if not candidate then
    local first = redis.call("ZRANGEBYLEX", active_key, "-", "+", "LIMIT", 0, 1)
    candidate = first[1]
  end
  if not candidate then
    return false
  end

  local queue_key = queue_prefix .. candidate
  local job_id = redis.call("LPOP", queue_key)
  if job_id then
    if redis.call("LLEN", queue_key) == 0 then
      redis.call("ZREM", active_key, candidate)
    end
    redis.call("SET", cursor_key, candidate)
    return { candidate, job_id }
  end

  redis.call("ZREM", active_key, candidate)
  cursor = candidate
end
return false
"#,
        );

        let popped: Option<(String, String)> = script
            .key(self.key_active_users(model))
            .key(self.key_rr_cursor(model))
            .arg(self.key_queue_prefix(model))
            .invoke_async(&mut conn)
            .await?;
        Ok(popped.map(|(user_id, job_id)| QueuedJob { user_id, job_id }))
    }

    async fn read_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: HashMap<String, String> = conn.hgetall(self.key_job(job_id)).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(job_record_from_map(job_id, &raw)?))
    }

    async fn abandon_queued(
        &self,
        model: &str,
        user_id: &str,
        job_id: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;

        let script = redis::Script::new(
            r#"
local queue_key = KEYS[1]
local active_key = KEYS[2]
local job_id = ARGV[1]
local user_id = ARGV[2]

redis.call("LREM", queue_key, 1, job_id)
if redis.call("LLEN", queue_key) == 0 then
  redis.call("ZREM", active_key, user_id)
end
return 1
"#,
        );

        let _: i64 = script
            .key(self.key_queue(model, user_id))
            .key(self.key_active_users(model))
            .arg(job_id)
            .arg(user_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear_job(&self, job_id: &str, attempt: u32) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let keys = vec![
            self.key_job(job_id),
            self.key_permit(job_id),
            self.key_scheduled(job_id),
            self.key_enqueued(job_id, attempt),
        ];
        let _: () = conn.del(keys).await?;
        Ok(())
    }

    async fn mark_scheduled(&self, job_id: &str, ttl_ms: u64) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key_scheduled(job_id))
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn write_permit(
        &self,
        job_id: &str,
        permit: &Permit,
        ttl_ms: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("SET")
            .arg(self.key_permit(job_id))
            .arg(permit.encode())
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn read_permit(&self, job_id: &str) -> Result<Option<Permit>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(self.key_permit(job_id)).await?;
        raw.map(|value| Permit::decode(&value)).transpose()
    }

    async fn reserve_day_slot(
        &self,
        model: &str,
        job_id: &str,
        rpd: u64,
        horizon_ms: u64,
    ) -> Result<DaySlot, StoreError> {
        let mut conn = self.connection().await?;

        let script = redis::Script::new(
            r#"
local rpd_key = KEYS[1]
local job_id = ARGV[1]
local rpd = tonumber(ARGV[2]) or 0
local horizon_ms = tonumber(ARGV[3]) or 0
local window_ms = tonumber(ARGV[4]) or 0

local t = redis.call("TIME")
local now = t[1] * 1000 + math.floor(t[2] / 1000)

redis.call("ZREMRANGEBYSCORE", rpd_key, "-inf", now - window_ms)

local start_at = now
if redis.call("ZCARD", rpd_key) >= rpd then
  local oldest = redis.call("ZRANGE", rpd_key, 0, 0, "WITHSCORES")
  if oldest[2] then
    start_at = tonumber(oldest[2]) + window_ms
  end
end

local delay = start_at - now
if delay > horizon_ms then
  return { "denied", tostring(delay) }
end

redis.call("ZADD", rpd_key, start_at, job_id)
redis.call("PEXPIRE", rpd_key, window_ms * 2)
return { "ok", tostring(start_at) }
"#,
        );

        let result: Vec<String> = script
            .key(self.key_rpd(model))
            .arg(job_id)
            .arg(rpd)
            .arg(horizon_ms)
            .arg(DAY_WINDOW_MS)
            .invoke_async(&mut conn)
            .await?;

        match result.first().map(|s| s.as_str()) {
            Some("ok") => {
                let Some(start_at_ms) = result.get(1).and_then(|raw| raw.parse::<u64>().ok())
                else {
                    return Err(unexpected_script_reply());
                };
                Ok(DaySlot::Reserved { start_at_ms })
            }
            Some("denied") => {
                let Some(retry_after_ms) = result.get(1).and_then(|raw| raw.parse::<u64>().ok())
                else {
                    return Err(unexpected_script_reply());
                };
                Ok(DaySlot::Denied { retry_after_ms })
            }
            _ => Err(unexpected_script_reply()),
        }
    }

    async fn release_day_slot(&self, model: &str, job_id: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.zrem(self.key_rpd(model), job_id).await?;
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
        let mut conn = self.connection().await?;

        let script = redis::Script::new(
            r#"
local rpm_key = KEYS[1]
local tpm_key = KEYS[2]
local rpm_interval = tonumber(ARGV[1]) or 0
local tpm_interval = tonumber(ARGV[2]) or 0
local floor_ms = tonumber(ARGV[3]) or 0
local horizon_ms = tonumber(ARGV[4]) or 0
local slack_ms = tonumber(ARGV[5]) or 0

local t = redis.call("TIME")
local now = t[1] * 1000 + math.floor(t[2] / 1000)

local next_rpm = tonumber(redis.call("GET", rpm_key) or "0") or 0
local next_tpm = tonumber(redis.call("GET", tpm_key) or "0") or 0

local start_at = now
if next_rpm > start_at then start_at = next_rpm end
if next_tpm > start_at then start_at = next_tpm end
if floor_ms > start_at then start_at = floor_ms end

local delay = start_at - now
if delay > horizon_ms then
  local kind = "rpm"
  if next_tpm > next_rpm then kind = "tpm" end
  return { "denied", kind, tostring(delay) }
end

redis.call("SET", rpm_key, tostring(start_at + rpm_interval), "PX", delay + rpm_interval + slack_ms)
redis.call("SET", tpm_key, tostring(start_at + tpm_interval), "PX", delay + tpm_interval + slack_ms)
return { "ok", tostring(start_at) }
"#,
        );

        let result: Vec<String> = script
            .key(self.key_next_rpm(model))
            .key(self.key_next_tpm(model))
            .arg(rpm_interval_ms)
            .arg(tpm_interval_ms)
            .arg(floor_ms)
            .arg(horizon_ms)
            .arg(PACER_SLACK_MS)
            .invoke_async(&mut conn)
            .await?;

        match result.first().map(|s| s.as_str()) {
            Some("ok") => {
                let Some(start_at_ms) = result.get(1).and_then(|raw| raw.parse::<u64>().ok())
                else {
                    return Err(unexpected_script_reply());
                };
                Ok(StartDecision::Start { start_at_ms })
            }
            Some("denied") => {
                let Some(kind) = result.get(1).and_then(|tag| RateLimitKind::from_tag(tag))
                else {
                    return Err(unexpected_script_reply());
                };
                let Some(retry_after_ms) = result.get(2).and_then(|raw| raw.parse::<u64>().ok())
                else {
                    return Err(unexpected_script_reply());
                };
                Ok(StartDecision::Denied {
                    kind,
                    retry_after_ms,
                })
            }
            _ => Err(unexpected_script_reply()),
        }
    }

    async fn shift_tpm_pacer(&self, model: &str, delta_ms: i64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;

        let script = redis::Script::new(
            r#"
local tpm_key = KEYS[1]
local delta_ms = tonumber(ARGV[1]) or 0
local slack_ms = tonumber(ARGV[2]) or 0

local t = redis.call("TIME")
local now = t[1] * 1000 + math.floor(t[2] / 1000)

local base = tonumber(redis.call("GET", tpm_key) or "0") or 0
if base < now then base = now end

local shifted = base + delta_ms
if shifted < now then shifted = now end

redis.call("SET", tpm_key, tostring(shifted), "PX", shifted - now + slack_ms)
return shifted
"#,
        );

        let _: i64 = script
            .key(self.key_next_tpm(model))
            .arg(delta_ms)
            .arg(PACER_SLACK_MS)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn prune_running(&self, model: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;

        let script = redis::Script::new(
            r#"
local active_jobs_key = KEYS[1]
local t = redis.call("TIME")
local now = t[1] * 1000 + math.floor(t[2] / 1000)
return redis.call("ZREMRANGEBYSCORE", active_jobs_key, "-inf", now)
"#,
        );

        let removed: u64 = script
            .key(self.key_active_jobs(model))
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn running_count(&self, model: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;

        let script = redis::Script::new(
            r#"
local active_jobs_key = KEYS[1]
local t = redis.call("TIME")
local now = t[1] * 1000 + math.floor(t[2] / 1000)
redis.call("ZREMRANGEBYSCORE", active_jobs_key, "-inf", now)
return redis.call("ZCARD", active_jobs_key)
"#,
        );

        let count: u64 = script
            .key(self.key_active_jobs(model))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn try_begin_running(
        &self,
        model: &str,
        job_id: &str,
        limit: u64,
        evict_at_ms: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;

        let script = redis::Script::new(
            r#"
local active_jobs_key = KEYS[1]
local job_id = ARGV[1]
local limit = tonumber(ARGV[2]) or 0
local evict_at_ms = ARGV[3]

local t = redis.call("TIME")
local now = t[1] * 1000 + math.floor(t[2] / 1000)
redis.call("ZREMRANGEBYSCORE", active_jobs_key, "-inf", now)

if redis.call("ZCARD", active_jobs_key) >= limit then
  return 0
end
redis.call("ZADD", active_jobs_key, evict_at_ms, job_id)
return 1
"#,
        );

        let admitted: i64 = script
            .key(self.key_active_jobs(model))
            .arg(job_id)
            .arg(limit)
            .arg(evict_at_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(admitted == 1)
    }

    async fn end_running(&self, model: &str, job_id: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.zrem(self.key_active_jobs(model), job_id).await?;
        Ok(())
    }

    async fn acquire_lease(
        &self,
        model: &str,
        holder: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key_lock(model))
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn renew_lease(
        &self,
        model: &str,
        holder: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;

        let script = redis::Script::new(
            r#"
local lock_key = KEYS[1]
local holder = ARGV[1]
local ttl_ms = ARGV[2]

if redis.call("GET", lock_key) == holder then
  redis.call("PEXPIRE", lock_key, ttl_ms)
  return 1
end
return 0
"#,
        );

        let renewed: i64 = script
            .key(self.key_lock(model))
            .arg(holder)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release_lease(&self, model: &str, holder: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;

        let script = redis::Script::new(
            r#"
local lock_key = KEYS[1]
local holder = ARGV[1]

if redis.call("GET", lock_key) == holder then
  redis.call("DEL", lock_key)
end
return 1
"#,
        );

        let _: i64 = script
            .key(self.key_lock(model))
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
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
        let mut conn = self.connection().await?;
        let latency_key = self.key_latency(model);
        let tokens_key = self.key_tokens(model);
        let route_key = self.key_route_tokens(model, route);
        let keep = window.max(1) as isize - 1;

        let _: () = redis::pipe()
            .atomic()
            .lpush(&latency_key, latency_ms)
            .ltrim(&latency_key, 0, keep)
            .pexpire(&latency_key, STATS_TTL_MS)
            .lpush(&tokens_key, tokens)
            .ltrim(&tokens_key, 0, keep)
            .pexpire(&tokens_key, STATS_TTL_MS)
            .lpush(&route_key, tokens)
            .ltrim(&route_key, 0, keep)
            .pexpire(&route_key, STATS_TTL_MS)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn latency_samples(&self, model: &str, window: usize) -> Result<Vec<u64>, StoreError> {
        let mut conn = self.connection().await?;
        let stop = window.max(1) as isize - 1;
        let samples: Vec<u64> = conn.lrange(self.key_latency(model), 0, stop).await?;
        Ok(samples)
    }

    async fn token_samples(&self, model: &str, window: usize) -> Result<Vec<u64>, StoreError> {
        let mut conn = self.connection().await?;
        let stop = window.max(1) as isize - 1;
        let samples: Vec<u64> = conn.lrange(self.key_tokens(model), 0, stop).await?;
        Ok(samples)
    }

    async fn route_token_samples(
        &self,
        model: &str,
        route: &str,
        window: usize,
    ) -> Result<Vec<u64>, StoreError> {
        let mut conn = self.connection().await?;
        let stop = window.max(1) as isize - 1;
        let samples: Vec<u64> = conn
            .lrange(self.key_route_tokens(model, route), 0, stop)
            .await?;
        Ok(samples)
    }

    async fn queue_depth(&self, model: &str, user_id: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(self.key_queue(model, user_id)).await?;
        Ok(depth)
    }

    async fn active_users(&self, model: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let users: Vec<String> = conn
            .zrangebylex(self.key_active_users(model), "-", "+")
            .await?;
        Ok(users)
    }

    async fn pacer_snapshot(&self, model: &str) -> Result<PacerSnapshot, StoreError> {
        let mut conn = self.connection().await?;
        let (next_rpm_ms, next_tpm_ms): (Option<u64>, Option<u64>) = redis::pipe()
            .get(self.key_next_rpm(model))
            .get(self.key_next_tpm(model))
            .query_async(&mut conn)
            .await?;
        let day_count: u64 = conn.zcard(self.key_rpd(model)).await?;
        Ok(PacerSnapshot {
            next_rpm_ms: next_rpm_ms.unwrap_or(0),
            next_tpm_ms: next_tpm_ms.unwrap_or(0),
            day_count,
        })
    }
}

fn job_record_from_map(
    job_id: &str,
    raw: &HashMap<String, String>,
) -> Result<JobRecord, StoreError> {
    let field = |name: &str| -> Result<String, StoreError> {
        raw.get(name)
            .cloned()
            .ok_or_else(|| StoreError::Malformed(format!("job {job_id} missing field {name}")))
    };
    let number = |name: &str| -> u64 {
        raw.get(name)
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0)
    };
    Ok(JobRecord {
        job_id: job_id.to_string(),
        model: field("model")?,
        user_id: field("user_id")?,
        route: field("route")?,
        estimated_tokens: number("estimated_tokens"),
        attempt: raw
            .get("attempt")
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(0),
        enqueued_at_ms: number("enqueued_at_ms"),
    })
}

fn unexpected_script_reply() -> StoreError {
    StoreError::Backend("unexpected redis script response".to_string())
}
