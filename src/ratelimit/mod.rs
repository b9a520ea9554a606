//! Rate limiting logic and state management.

mod backend;
mod counter;
mod descriptor;
mod distributed;
mod limiter;
mod policy;

pub use backend::{RateLimitDecision, WindowCounter};
pub use counter::{SlidingWindowCounter, TimeWindow};
pub use descriptor::{normalize_path, route_key, Identity, RequestDescriptor};
pub use distributed::DistributedWindowCounter;
pub use limiter::RateLimiter;
pub use policy::{LimitSpec, RateLimitPolicy, Tier};
