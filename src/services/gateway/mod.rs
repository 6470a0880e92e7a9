//! API gateway module
//!
//! This module contains the public façade composing the resilience layer:
//! - `types`: Route, aggregation/transformation variants, request/response shapes
//! - `cache`: TTL response cache with background sweeping
//! - `service`: Route matching, auth enforcement, resilient dispatch

pub mod cache;
pub mod service;
pub mod types;

// Re-export public types for easier access
pub use cache::ResponseCache;
pub use service::ApiGateway;
pub use types::{
    Aggregation, AggregationTarget, GatewayRequest, GatewayResponse, GatewayStats, Route,
    Transformation, UpstreamResponse,
};
