use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::RateLimitKind;

/// Point-in-time export of the process-local counters. Counters are per
/// replica; cluster-wide views come from the shared store, not from here.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub permits_issued: u64,
    pub permits_denied: u64,
    pub rate_limited: RateLimitedCounts,
    pub retries: u64,
    pub permit_timeouts: u64,
    pub upstream_errors: u64,
    pub completions: u64,
    pub streams_opened: u64,
    pub streams_aborted: u64,
    pub store_failures: u64,
    pub fail_open_admissions: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RateLimitedCounts {
    pub rpm: u64,
    pub tpm: u64,
    pub rpd: u64,
    pub tpm_call_too_large: u64,
    pub misconfigured: u64,
}

#[derive(Debug, Default)]
pub struct GatewayMetrics {
    enqueued: AtomicU64,
    permits_issued: AtomicU64,
    permits_denied: AtomicU64,
    rate_limited_rpm: AtomicU64,
    rate_limited_tpm: AtomicU64,
    rate_limited_rpd: AtomicU64,
    rate_limited_too_large: AtomicU64,
    rate_limited_misconfigured: AtomicU64,
    retries: AtomicU64,
    permit_timeouts: AtomicU64,
    upstream_errors: AtomicU64,
    completions: AtomicU64,
    streams_opened: AtomicU64,
    streams_aborted: AtomicU64,
    store_failures: AtomicU64,
    fail_open_admissions: AtomicU64,
}

impl GatewayMetrics {
    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_permit_issued(&self) {
        self.permits_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_permit_denied(&self) {
        self.permits_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self, kind: RateLimitKind) {
        let counter = match kind {
            RateLimitKind::Rpm => &self.rate_limited_rpm,
            RateLimitKind::Tpm => &self.rate_limited_tpm,
            RateLimitKind::Rpd => &self.rate_limited_rpd,
            RateLimitKind::TpmCallTooLarge => &self.rate_limited_too_large,
            RateLimitKind::Misconfigured => &self.rate_limited_misconfigured,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_permit_timeout(&self) {
        self.permit_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self) {
        self.completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_aborted(&self) {
        self.streams_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fail_open(&self) {
        self.fail_open_admissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            permits_issued: self.permits_issued.load(Ordering::Relaxed),
            permits_denied: self.permits_denied.load(Ordering::Relaxed),
            rate_limited: RateLimitedCounts {
                rpm: self.rate_limited_rpm.load(Ordering::Relaxed),
                tpm: self.rate_limited_tpm.load(Ordering::Relaxed),
                rpd: self.rate_limited_rpd.load(Ordering::Relaxed),
                tpm_call_too_large: self.rate_limited_too_large.load(Ordering::Relaxed),
                misconfigured: self.rate_limited_misconfigured.load(Ordering::Relaxed),
            },
            retries: self.retries.load(Ordering::Relaxed),
            permit_timeouts: self.permit_timeouts.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            streams_aborted: self.streams_aborted.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            fail_open_admissions: self.fail_open_admissions.load(Ordering::Relaxed),
        }
    }
}
