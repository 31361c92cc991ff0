//! Advisory request guards, checked before any balance mutation.

pub mod cache;
pub mod dedup;
pub mod rate_limit;

pub use cache::TtlCache;
pub use dedup::{content_hash, DedupGuard};
pub use rate_limit::{RateDecision, RateLimitReason, RateLimiter};
