//! Client-side gRPC transport stack for talking to tenant backends.
//!
//! Three layers, used together by the gateway router:
//! - [`client`] — transport-level configuration (timeouts, HTTP/2
//!   keepalive) and connection helpers;
//! - [`retry`] — RPC-level retries with backoff for transient failures;
//! - [`breaker`] — a per-endpoint circuit breaker that stops hammering a
//!   backend that keeps failing.

pub mod breaker;
pub mod client;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use client::{GrpcClientConfig, connect, connect_with_stack};
pub use retry::{RetryConfig, call_with_retry};
