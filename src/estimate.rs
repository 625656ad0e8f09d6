use serde_json::Value;

/// Fixed character envelope charged for non-text payload blocks (images,
/// audio, arbitrary media references).
pub const MEDIA_ENVELOPE_CHARS: u64 = 1_024;

/// Observed route means override the structural estimate once this many
/// samples exist.
pub const ROUTE_OVERRIDE_MIN_SAMPLES: usize = 5;

const CHARS_PER_TOKEN: u64 = 4;

const CONTENT_KEYS: [&str; 8] = [
    "messages",
    "content",
    "parts",
    "input",
    "instructions",
    "prompt",
    "system",
    "text",
];

/// Maps a pending call to an integer token cost. Implementations never error;
/// a degenerate payload costs the configured default.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, payload: &Value, completion_tokens_hint: Option<u64>) -> u64;
}

/// Structural estimator: flattened payload characters at four chars per token,
/// plus the completion budget (hint or service default).
#[derive(Clone, Debug)]
pub struct HeuristicEstimator {
    default_completion_tokens: u64,
}

impl HeuristicEstimator {
    pub fn new(default_completion_tokens: u64) -> Self {
        Self {
            default_completion_tokens,
        }
    }
}

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, payload: &Value, completion_tokens_hint: Option<u64>) -> u64 {
        let input_tokens = payload_chars(payload).div_ceil(CHARS_PER_TOKEN);
        let completion = completion_tokens_hint.unwrap_or(self.default_completion_tokens);
        input_tokens.saturating_add(completion).max(1)
    }
}

/// Replaces the structural estimate with `ceil(1.1 * route_mean)` once enough
/// observations exist for the route.
pub fn estimate_with_route_mean(structural: u64, mean_tokens: f64, samples: usize) -> u64 {
    if samples < ROUTE_OVERRIDE_MIN_SAMPLES || !mean_tokens.is_finite() || mean_tokens <= 0.0 {
        return structural;
    }
    ((mean_tokens * 1.1).ceil() as u64).max(1)
}

fn payload_chars(value: &Value) -> u64 {
    match value {
        Value::String(text) => text.len() as u64,
        Value::Array(items) => items.iter().map(payload_chars).sum(),
        Value::Object(obj) => {
            if let Some(part_type) = obj.get("type").and_then(|value| value.as_str()) {
                if part_type != "text" && part_type != "input_text" {
                    return MEDIA_ENVELOPE_CHARS;
                }
                if let Some(text) = obj.get("text").and_then(|value| value.as_str()) {
                    return text.len() as u64;
                }
            }
            let mut total: u64 = 0;
            let mut matched = false;
            for key in CONTENT_KEYS {
                if let Some(inner) = obj.get(key) {
                    matched = true;
                    total = total.saturating_add(payload_chars(inner));
                }
            }
            if matched {
                total
            } else {
                obj.values().map(payload_chars).sum()
            }
        }
        _ => 0,
    }
}
