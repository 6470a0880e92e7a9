//! Retry policy module
//!
//! This module contains the retry engine implementation:
//! - `types`: Policy definitions, retryable error classes, backoff math
//! - `service`: Policy table and breaker-coupled retry loop

pub mod service;
pub mod types;

// Re-export public types for easier access
pub use service::RetryService;
pub use types::{RetryPolicy, RetryStats, RetryableError};
