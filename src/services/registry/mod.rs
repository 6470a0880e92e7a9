//! Registry service module
//!
//! This module contains the service registry implementation split into logical components:
//! - `types`: Data structures and type definitions
//! - `service`: Core registry logic and load balancing
//! - `health`: Active HTTP health probing

pub mod health;
pub mod service;
pub mod types;

// Re-export public types for easier access
pub use health::HealthProber;
pub use service::{InflightGuard, ServiceRegistry};
pub use types::{LoadBalancingStrategy, RegistryStats, ServiceInstance};
