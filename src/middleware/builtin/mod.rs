mod basic_auth;
mod buffering;
mod circuit_breaker;
mod forward_auth;
mod headers;
mod in_flight;
mod ip_allow_list;
mod path;
mod rate_limit;
mod retry;

pub use basic_auth::BasicAuthMiddleware;
pub use buffering::{BufferingMiddleware, RETRY_FUNCTIONS};
pub use circuit_breaker::{BreakerState, CircuitBreakerMiddleware, BREAKER_FUNCTIONS};
pub use forward_auth::ForwardAuthMiddleware;
pub use headers::HeadersMiddleware;
pub use in_flight::InFlightMiddleware;
pub use ip_allow_list::IpAllowListMiddleware;
pub use path::PathRewrite;
pub use rate_limit::RateLimitMiddleware;
pub use retry::{RetryListener, RetryMiddleware};
