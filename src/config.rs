use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::limits::LimitsConfig;

/// Gateway tuning knobs. Every field has a serde default so a config file only
/// names what it changes; `[limits]` carries the per-model quota tables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_est_tokens")]
    pub default_est_tokens: u64,
    #[serde(default = "default_stats_window")]
    pub stats_window: usize,
    #[serde(default = "default_scheduler_poll_ms")]
    pub scheduler_poll_ms: u64,
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    #[serde(default = "default_permit_ttl_ms")]
    pub permit_ttl_ms: u64,
    #[serde(default = "default_permit_wait_ms")]
    pub permit_wait_ms: u64,
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
    #[serde(default = "default_backoff_base_s")]
    pub backoff_base_s: f64,
    #[serde(default = "default_backoff_cap_s")]
    pub backoff_cap_s: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_status_codes")]
    pub retry_status_codes: Vec<u16>,
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
    #[serde(default = "default_store_failure_burst")]
    pub store_failure_burst: u32,
    #[serde(default = "default_store_failure_cooldown_s")]
    pub store_failure_cooldown_s: u64,
    #[serde(default)]
    pub limits: LimitsConfig,
}

fn default_key_prefix() -> String {
    "llm".to_string()
}

fn default_est_tokens() -> u64 {
    12_000
}

fn default_stats_window() -> usize {
    200
}

fn default_scheduler_poll_ms() -> u64 {
    50
}

fn default_lock_ttl_ms() -> u64 {
    15_000
}

fn default_permit_ttl_ms() -> u64 {
    300_000
}

fn default_permit_wait_ms() -> u64 {
    60_000
}

fn default_jitter_max_ms() -> u64 {
    100
}

fn default_backoff_base_s() -> f64 {
    1.0
}

fn default_backoff_cap_s() -> f64 {
    30.0
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_status_codes() -> Vec<u16> {
    vec![429, 500, 503, 504]
}

fn default_fail_open() -> bool {
    true
}

fn default_store_failure_burst() -> u32 {
    10
}

fn default_store_failure_cooldown_s() -> u64 {
    30
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            default_est_tokens: default_est_tokens(),
            stats_window: default_stats_window(),
            scheduler_poll_ms: default_scheduler_poll_ms(),
            lock_ttl_ms: default_lock_ttl_ms(),
            permit_ttl_ms: default_permit_ttl_ms(),
            permit_wait_ms: default_permit_wait_ms(),
            jitter_max_ms: default_jitter_max_ms(),
            backoff_base_s: default_backoff_base_s(),
            backoff_cap_s: default_backoff_cap_s(),
            max_retries: default_max_retries(),
            retry_status_codes: default_retry_status_codes(),
            fail_open: default_fail_open(),
            store_failure_burst: default_store_failure_burst(),
            store_failure_cooldown_s: default_store_failure_cooldown_s(),
            limits: LimitsConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: GatewayConfig = toml::from_str(raw).map_err(|err| GatewayError::Config {
            reason: format!("parse toml: {err}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| GatewayError::Config {
            reason: format!("read {}: {err}", path.display()),
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.trim().is_empty() {
            return Err(invalid("key_prefix must be non-empty"));
        }
        if self.default_est_tokens == 0 {
            return Err(invalid("default_est_tokens must be >= 1"));
        }
        if self.stats_window == 0 {
            return Err(invalid("stats_window must be >= 1"));
        }
        if self.scheduler_poll_ms == 0 {
            return Err(invalid("scheduler_poll_ms must be >= 1"));
        }
        if self.lock_ttl_ms < 1_000 {
            return Err(invalid("lock_ttl_ms must be >= 1000"));
        }
        if self.permit_ttl_ms < 1_000 {
            return Err(invalid("permit_ttl_ms must be >= 1000"));
        }
        if self.permit_wait_ms < self.scheduler_poll_ms {
            return Err(invalid("permit_wait_ms must cover at least one poll"));
        }
        if !self.backoff_base_s.is_finite() || self.backoff_base_s <= 0.0 {
            return Err(invalid("backoff_base_s must be a positive number"));
        }
        if !self.backoff_cap_s.is_finite() || self.backoff_cap_s < self.backoff_base_s {
            return Err(invalid("backoff_cap_s must be >= backoff_base_s"));
        }

        let table = self.limits.build();
        if let Some(reason) = table.fallback.invalid_reason() {
            return Err(invalid(format!("limits.fallback: {reason}")));
        }
        for (name, limits) in &table.providers {
            if let Some(reason) = limits.invalid_reason() {
                return Err(invalid(format!("limits.providers.{name}: {reason}")));
            }
        }
        for (name, limits) in &table.models {
            if let Some(reason) = limits.invalid_reason() {
                return Err(invalid(format!("limits.models.{name}: {reason}")));
            }
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> GatewayError {
    GatewayError::Config {
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_toml_yields_the_documented_defaults() {
        let config = GatewayConfig::from_toml_str("").unwrap();
        assert_eq!(config.key_prefix, "llm");
        assert_eq!(config.default_est_tokens, 12_000);
        assert_eq!(config.stats_window, 200);
        assert_eq!(config.scheduler_poll_ms, 50);
        assert_eq!(config.lock_ttl_ms, 15_000);
        assert_eq!(config.permit_ttl_ms, 300_000);
        assert_eq!(config.permit_wait_ms, 60_000);
        assert_eq!(config.jitter_max_ms, 100);
        assert_eq!(config.backoff_base_s, 1.0);
        assert_eq!(config.backoff_cap_s, 30.0);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_status_codes, vec![429, 500, 503, 504]);
        assert!(config.fail_open);
    }

    #[test]
    fn limits_tables_parse_and_burst_defaults_to_tpm() {
        let raw = r#"
            default_est_tokens = 4000

            [limits.fallback]
            rpm = 30
            tpm = 50000
            rpd = 5000

            [limits.providers.openai]
            rpm = 500
            tpm = 2000000
            rpd = 100000

            [limits.models."openai/gpt-test"]
            rpm = 60
            tpm = 60000
            rpd = 1000
            tpm_burst = 30000
        "#;
        let config = GatewayConfig::from_toml_str(raw).unwrap();
        let table = config.limits.build();
        assert_eq!(table.fallback.tpm_burst, 50_000);
        let model = table.models.get("openai/gpt-test").unwrap();
        assert_eq!(model.tpm_burst, 30_000);
        let provider = table.providers.get("openai").unwrap();
        assert_eq!(provider.tpm_burst, 2_000_000);
    }

    #[test]
    fn zero_quota_in_config_is_rejected_at_load() {
        let raw = r#"
            [limits.models."acme/broken"]
            rpm = 0
            tpm = 1000
            rpd = 10
        "#;
        let err = GatewayConfig::from_toml_str(raw).unwrap_err();
        assert!(err.to_string().contains("acme/broken"));
    }

    #[test]
    fn backoff_cap_below_base_is_rejected() {
        let raw = "backoff_base_s = 5.0\nbackoff_cap_s = 1.0\n";
        assert!(GatewayConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn loads_from_a_file_on_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "scheduler_poll_ms = 25").unwrap();
        let config = GatewayConfig::from_toml_path(file.path()).unwrap();
        assert_eq!(config.scheduler_poll_ms, 25);
    }
}
