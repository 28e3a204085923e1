//! Re-exports the types most request handlers need.
//!
//! # Example
//! ```rust,no_run
//! use upstream_guard::prelude::*;
//! ```

pub use crate::{
    with_retry, BreakerError, BreakerRegistry, CircuitBreaker, ProtectedBackend, ResourceManager,
    RetryOptions, RetryPolicy, State, StreamTransport, UpstreamError,
};
