//! Rate limiting logic and state management.

mod decision;
mod limiter;
mod window;

pub use decision::{format_seconds, Decision, LimitScope, Rejection};
pub use limiter::{RateLimiter, Status};
pub use window::SlidingWindow;
