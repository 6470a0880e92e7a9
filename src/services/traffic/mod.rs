//! Traffic routing module
//!
//! This module contains rule-based version selection and canary deployments:
//! - `types`: Rule variants, canary lifecycle types, stable hash bucketing
//! - `service`: Rule evaluation, canary split/promote/rollback

pub mod service;
pub mod types;

// Re-export public types for easier access
pub use service::TrafficRouter;
pub use types::{
    CanaryDeployment, CanaryMetrics, CanaryStatus, RuleMatch, TrafficRoute, TrafficRule,
    TrafficStats, bucket_for,
};
