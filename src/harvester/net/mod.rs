// Network resilience layer: rate limiter, circuit breaker, proxy pool

pub mod breaker;
pub mod proxy_pool;
pub mod rate_limiter;

pub use breaker::CircuitBreaker;
pub use proxy_pool::{ProxyPool, ProxyPoolOptions, ProxySnapshot};
pub use rate_limiter::RateLimiter;
