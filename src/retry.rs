use std::time::Duration;

use rand::Rng;

use crate::error::{GatewayError, UpstreamError};

/// Exponential backoff with full jitter. `delay` draws uniformly from
/// `[0, min(cap, base * 2^attempt))`; an upstream `Retry-After` floors the
/// draw so the gateway never lands before the upstream asked.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    base_s: f64,
    cap_s: f64,
    max_retries: u32,
}

impl BackoffPolicy {
    pub fn new(base_s: f64, cap_s: f64, max_retries: u32) -> Self {
        Self {
            base_s,
            cap_s,
            max_retries,
        }
    }

    /// `attempt` is the attempt that just failed, counted from zero.
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = self.base_s * 2f64.powi(attempt.min(31) as i32);
        let ceiling = exp.min(self.cap_s).max(0.0);
        let jittered = if ceiling > 0.0 {
            rand::rng().random_range(0.0..ceiling)
        } else {
            0.0
        };
        let floor = retry_after.map(|d| d.as_secs_f64()).unwrap_or(0.0);
        Duration::from_secs_f64(jittered.max(floor))
    }
}

pub fn is_retryable_upstream(error: &UpstreamError, retry_status_codes: &[u16]) -> bool {
    match error {
        UpstreamError::Network { .. } => true,
        UpstreamError::Status { code, .. } => retry_status_codes.contains(code),
        UpstreamError::Other { .. } => false,
    }
}

/// Quota denials are terminal for the caller; only transient upstream
/// failures and lost permits re-enter the queue.
pub fn is_retryable(error: &GatewayError, retry_status_codes: &[u16]) -> bool {
    match error {
        GatewayError::PermitTimeout { .. } => true,
        GatewayError::Upstream(upstream) => is_retryable_upstream(upstream, retry_status_codes),
        _ => false,
    }
}

pub fn retry_after_hint(error: &GatewayError) -> Option<Duration> {
    match error {
        GatewayError::Upstream(UpstreamError::Status {
            retry_after_s: Some(seconds),
            ..
        }) if seconds.is_finite() && *seconds >= 0.0 => Some(Duration::from_secs_f64(*seconds)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RateLimitKind;

    const DEFAULT_CODES: [u16; 4] = [429, 500, 503, 504];

    #[test]
    fn network_and_configured_statuses_are_retryable() {
        assert!(is_retryable_upstream(
            &UpstreamError::network("connection reset"),
            &DEFAULT_CODES
        ));
        assert!(is_retryable_upstream(
            &UpstreamError::status(429, "slow down"),
            &DEFAULT_CODES
        ));
        assert!(is_retryable_upstream(
            &UpstreamError::status(503, "overloaded"),
            &DEFAULT_CODES
        ));
        assert!(!is_retryable_upstream(
            &UpstreamError::status(400, "bad request"),
            &DEFAULT_CODES
        ));
        assert!(!is_retryable_upstream(
            &UpstreamError::status(418, "teapot"),
            &DEFAULT_CODES
        ));
        assert!(!is_retryable_upstream(
            &UpstreamError::other("schema mismatch"),
            &DEFAULT_CODES
        ));
    }

    #[test]
    fn extra_codes_widen_the_retry_set() {
        let widened = [429, 500, 502, 503, 504];
        assert!(is_retryable_upstream(
            &UpstreamError::status(502, "bad gateway"),
            &widened
        ));
        assert!(!is_retryable_upstream(
            &UpstreamError::status(502, "bad gateway"),
            &DEFAULT_CODES
        ));
    }

    #[test]
    fn permit_timeouts_retry_but_quota_denials_do_not() {
        let timeout = GatewayError::PermitTimeout {
            job_id: "j1".to_string(),
            model: "acme/m".to_string(),
            waited_ms: 60_000,
        };
        assert!(is_retryable(&timeout, &DEFAULT_CODES));

        let denied = GatewayError::RateLimited {
            kind: RateLimitKind::Rpd,
            model: "acme/m".to_string(),
            route: "chat".to_string(),
            retry_after_s: Some(86_400.0),
        };
        assert!(!is_retryable(&denied, &DEFAULT_CODES));
    }

    #[test]
    fn delay_stays_under_the_exponential_ceiling() {
        let policy = BackoffPolicy::new(1.0, 30.0, 5);
        for _ in 0..100 {
            let d = policy.delay(0, None).as_secs_f64();
            assert!((0.0..1.0).contains(&d));
        }
        for _ in 0..100 {
            let d = policy.delay(2, None).as_secs_f64();
            assert!((0.0..4.0).contains(&d));
        }
        // Deep attempts saturate at the cap.
        for _ in 0..100 {
            let d = policy.delay(30, None).as_secs_f64();
            assert!((0.0..30.0).contains(&d));
        }
    }

    #[test]
    fn retry_after_floors_the_draw() {
        let policy = BackoffPolicy::new(1.0, 30.0, 5);
        for _ in 0..100 {
            let d = policy.delay(0, Some(Duration::from_secs(2)));
            assert!(d >= Duration::from_secs(2));
        }
    }

    #[test]
    fn retry_after_hint_requires_a_finite_nonnegative_value() {
        let hinted: GatewayError = UpstreamError::status_with_retry_after(429, 2.5, "").into();
        assert_eq!(retry_after_hint(&hinted), Some(Duration::from_secs_f64(2.5)));

        let bare: GatewayError = UpstreamError::status(429, "").into();
        assert_eq!(retry_after_hint(&bare), None);

        let negative: GatewayError = UpstreamError::status_with_retry_after(429, -1.0, "").into();
        assert_eq!(retry_after_hint(&negative), None);
    }

    #[test]
    fn attempt_budget_counts_from_zero() {
        let policy = BackoffPolicy::new(1.0, 30.0, 5);
        assert!(policy.can_retry(0));
        assert!(policy.can_retry(4));
        assert!(!policy.can_retry(5));
    }
}
