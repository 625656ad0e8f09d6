use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical `provider/name` identifier for one upstream model.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelKey(String);

impl ModelKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn provider(&self) -> &str {
        self.0.split_once('/').map(|(p, _)| p).unwrap_or("default")
    }
}

impl std::fmt::Display for ModelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hard quotas for one model. `tpm_burst` bounds the largest single call the
/// pacer will ever admit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimits {
    pub rpm: u64,
    pub tpm: u64,
    pub rpd: u64,
    pub tpm_burst: u64,
}

impl Default for ModelLimits {
    fn default() -> Self {
        Self {
            rpm: 60,
            tpm: 100_000,
            rpd: 10_000,
            tpm_burst: 100_000,
        }
    }
}

impl ModelLimits {
    pub fn rpm_interval_ms(&self) -> u64 {
        60_000u64.div_ceil(self.rpm.max(1))
    }

    pub fn tpm_interval_ms(&self, estimated_tokens: u64) -> u64 {
        estimated_tokens
            .saturating_mul(60_000)
            .div_ceil(self.tpm.max(1))
    }

    /// Milliseconds to shift the TPM pacer by after observing `actual` tokens
    /// against a reservation of `estimated`. Negative when the call came in
    /// under its estimate.
    pub fn reconcile_delta_ms(&self, estimated: u64, actual: u64) -> i64 {
        let delta_tokens = actual as i128 - estimated as i128;
        let delta_ms = delta_tokens * 60_000 / self.tpm.max(1) as i128;
        delta_ms.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    pub(crate) fn invalid_reason(&self) -> Option<String> {
        if self.rpm == 0 || self.tpm == 0 || self.rpd == 0 {
            return Some(format!(
                "zero quota (rpm={} tpm={} rpd={})",
                self.rpm, self.tpm, self.rpd
            ));
        }
        let floor = self.tpm.div_ceil(60);
        if self.tpm_burst < floor {
            return Some(format!(
                "tpm_burst={} below tpm/60={floor}",
                self.tpm_burst
            ));
        }
        None
    }
}

/// One `{rpm, tpm, rpd, tpm_burst?}` record as written in config files;
/// `tpm_burst` defaults to `tpm`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LimitsEntry {
    pub rpm: u64,
    pub tpm: u64,
    pub rpd: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm_burst: Option<u64>,
}

impl LimitsEntry {
    pub fn into_limits(self) -> ModelLimits {
        ModelLimits {
            rpm: self.rpm,
            tpm: self.tpm,
            rpd: self.rpd,
            tpm_burst: self.tpm_burst.unwrap_or(self.tpm),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<LimitsEntry>,
    #[serde(default)]
    pub providers: BTreeMap<String, LimitsEntry>,
    #[serde(default)]
    pub models: BTreeMap<String, LimitsEntry>,
}

impl LimitsConfig {
    pub fn build(&self) -> LimitsTable {
        LimitsTable {
            fallback: self
                .fallback
                .map(LimitsEntry::into_limits)
                .unwrap_or_default(),
            providers: self
                .providers
                .iter()
                .map(|(name, entry)| (name.to_ascii_lowercase(), entry.into_limits()))
                .collect(),
            models: self
                .models
                .iter()
                .map(|(name, entry)| (name.to_ascii_lowercase(), entry.into_limits()))
                .collect(),
        }
    }
}

/// Resolved limit table. Model keys are lowercase `provider/name`; provider
/// entries cover every model of that provider without its own row.
#[derive(Clone, Debug, Default)]
pub struct LimitsTable {
    pub fallback: ModelLimits,
    pub providers: BTreeMap<String, ModelLimits>,
    pub models: BTreeMap<String, ModelLimits>,
}

#[derive(Debug, Error)]
#[error("limits for {model} are unusable: {reason}")]
pub struct InvalidLimits {
    pub model: String,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct ResolvedModel {
    pub key: ModelKey,
    pub limits: ModelLimits,
}

/// Maps raw model names to canonical keys and quotas. Replaceable at runtime;
/// every resolve sees the current table.
#[derive(Debug, Default)]
pub struct LimitPolicy {
    table: RwLock<LimitsTable>,
}

impl LimitPolicy {
    pub fn new(table: LimitsTable) -> Self {
        Self {
            table: RwLock::new(table),
        }
    }

    pub fn replace(&self, table: LimitsTable) {
        let mut guard = self
            .table
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = table;
    }

    pub fn set_model(&self, key: impl Into<String>, limits: ModelLimits) {
        let mut guard = self
            .table
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        guard.models.insert(key.into().to_ascii_lowercase(), limits);
    }

    pub fn resolve(&self, raw: &str) -> Result<ResolvedModel, InvalidLimits> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let trimmed = raw.trim().to_ascii_lowercase();
        if trimmed.is_empty() {
            return Err(InvalidLimits {
                model: "<empty>".to_string(),
                reason: "empty model name".to_string(),
            });
        }

        let key = canonical_key(&table, &trimmed);
        let provider = key.split_once('/').map(|(p, _)| p).unwrap_or("default");
        let limits = table
            .models
            .get(&key)
            .or_else(|| table.providers.get(provider))
            .copied()
            .unwrap_or(table.fallback);

        if let Some(reason) = limits.invalid_reason() {
            return Err(InvalidLimits { model: key, reason });
        }
        Ok(ResolvedModel {
            key: ModelKey(key),
            limits,
        })
    }
}

fn canonical_key(table: &LimitsTable, trimmed: &str) -> String {
    if trimmed.contains('/') {
        return trimmed.to_string();
    }
    // A bare family-variant name aliases a configured provider-prefixed key
    // only when exactly one key carries that suffix; an ambiguous name stays
    // in the default namespace.
    let suffix = format!("/{trimmed}");
    let mut matches = table.models.keys().filter(|key| key.ends_with(&suffix));
    match (matches.next(), matches.next()) {
        (Some(key), None) => key.clone(),
        _ => format!("default/{trimmed}"),
    }
}
