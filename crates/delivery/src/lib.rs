//! Delivery controls — pacing, per-user frequency, per-line-item rate limits.

pub mod frequency;
pub mod pacing;
pub mod rate_limit;

pub use frequency::FrequencyEvaluator;
pub use pacing::{PacingDecision, PacingEvaluator, PacingReason};
pub use rate_limit::{BucketStats, RateLimiter};
