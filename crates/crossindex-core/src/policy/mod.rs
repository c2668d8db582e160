//! Reliability policies shared by the watcher, the normalizer, and the orphan
//! queue.
//!
//! ```text
//! RPC call → [RateLimiter] → HTTP ─fail→ [RetryPolicy] → retry same range
//! ```

pub mod rate_limiter;
pub mod retry;

pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::{RetryConfig, RetryPolicy};
