//! Resilience primitives used around provider calls.
//!
//! # Data Flow
//! ```text
//! Provider call:
//!     → circuit_breaker.rs (fail fast while the endpoint is open)
//!     → retry.rs (retry eligible transport errors with backoff)
//!     → backoff.rs (delay computation, Retry-After handling)
//! ```
//!
//! The flow engine reuses `backoff.rs` for its polling and status-retry delays.

pub mod backoff;
pub mod circuit_breaker;
pub mod retry;

pub use backoff::{BackoffConfig, HttpMethod, TransportError, compute_delay, should_retry};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitState};
pub use retry::{RetryError, RetryExhaustedError, RetryOperator};
