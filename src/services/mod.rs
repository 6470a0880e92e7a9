//! Service mesh components: registry, resilience, auth, traffic and the gateway

pub mod auth;
pub mod breaker;
pub mod control;
pub mod gateway;
pub mod registry;
pub mod retry;
pub mod traffic;

// Re-export the control plane, which owns every other component
pub use control::ControlPlane;
