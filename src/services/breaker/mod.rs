//! Circuit breaker module
//!
//! This module contains the per-name circuit breaker implementation:
//! - `types`: State machine data structures and configuration
//! - `service`: Breaker registry, call permits and state transitions

pub mod service;
pub mod types;

// Re-export public types for easier access
pub use service::{CallPermit, CircuitBreakerService};
pub use types::{BreakerConfig, BreakerSnapshot, BreakerStats, CircuitState};
