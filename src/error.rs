use thiserror::Error;

/// Which quota turned the call away.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitKind {
    Rpm,
    Tpm,
    Rpd,
    TpmCallTooLarge,
    Misconfigured,
}

impl RateLimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitKind::Rpm => "rpm",
            RateLimitKind::Tpm => "tpm",
            RateLimitKind::Rpd => "rpd",
            RateLimitKind::TpmCallTooLarge => "tpm_call_too_large",
            RateLimitKind::Misconfigured => "misconfigured",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "rpm" => Some(RateLimitKind::Rpm),
            "tpm" => Some(RateLimitKind::Tpm),
            "rpd" => Some(RateLimitKind::Rpd),
            "tpm_call_too_large" => Some(RateLimitKind::TpmCallTooLarge),
            "misconfigured" => Some(RateLimitKind::Misconfigured),
            _ => None,
        }
    }
}

impl std::fmt::Display for RateLimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error produced by the caller-supplied upstream invocation. The gateway never
/// constructs these itself; it only classifies them for retry and passes them
/// through unchanged.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream network error: {message}")]
    Network { message: String },
    #[error("upstream status {code}: {body}")]
    Status {
        code: u16,
        retry_after_s: Option<f64>,
        body: String,
    },
    #[error("upstream error: {message}")]
    Other { message: String },
}

impl UpstreamError {
    pub fn network(message: impl Into<String>) -> Self {
        UpstreamError::Network {
            message: message.into(),
        }
    }

    pub fn status(code: u16, body: impl Into<String>) -> Self {
        UpstreamError::Status {
            code,
            retry_after_s: None,
            body: body.into(),
        }
    }

    pub fn status_with_retry_after(code: u16, retry_after_s: f64, body: impl Into<String>) -> Self {
        UpstreamError::Status {
            code,
            retry_after_s: Some(retry_after_s),
            body: body.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        UpstreamError::Other {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("malformed store value: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("rate limited ({kind}) on {model}")]
    RateLimited {
        kind: RateLimitKind,
        model: String,
        route: String,
        retry_after_s: Option<f64>,
    },
    #[error("no permit for job {job_id} on {model} within {waited_ms} ms")]
    PermitTimeout {
        job_id: String,
        model: String,
        waited_ms: u64,
    },
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid configuration: {reason}")]
    Config { reason: String },
}

impl GatewayError {
    pub fn retry_after_s(&self) -> Option<f64> {
        match self {
            GatewayError::RateLimited { retry_after_s, .. } => *retry_after_s,
            GatewayError::Upstream(UpstreamError::Status { retry_after_s, .. }) => *retry_after_s,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
