pub mod config;
mod error;
pub mod estimate;
mod gateway;
pub mod limits;
mod observability;
mod pipeline;
mod retry;
mod scheduler;
pub mod stats;
pub mod store;
mod stream;

pub use config::GatewayConfig;
pub use error::{GatewayError, RateLimitKind, Result, StoreError, UpstreamError};
pub use estimate::{HeuristicEstimator, TokenEstimator};
pub use gateway::{CallOutcome, CallRequest, Gateway};
pub use limits::{LimitsConfig, LimitsEntry, ModelKey, ModelLimits};
pub use observability::{MetricsSnapshot, RateLimitedCounts};
pub use stats::{Stats, UsageSummary};
pub use store::SharedStore;
pub use store::memory::MemoryStore;
#[cfg(feature = "store-redis")]
pub use store::redis::RedisStore;
pub use stream::{ChunkUsage, MeteredStream};
