//! Control plane module
//!
//! This module aggregates configuration, statistics and health across subsystems:
//! - `types`: Settings, merged stats and health report shapes
//! - `service`: Component construction and config fan-out
//! - `http`: Administrative HTTP API under /mesh

pub mod http;
pub mod service;
pub mod types;

// Re-export public types for easier access
pub use http::{ApiError, Envelope, admin_router};
pub use service::ControlPlane;
pub use types::{MeshHealth, MeshSettings, MeshStats, SettingsUpdate};
