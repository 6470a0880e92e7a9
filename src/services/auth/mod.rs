//! Service auth module
//!
//! This module contains certificate issuing and ACL enforcement:
//! - `types`: Certificate and ACL data structures
//! - `service`: Issue/verify/authorize logic with default-deny semantics

pub mod service;
pub mod types;

// Re-export public types for easier access
pub use service::AuthService;
pub use types::{AclEntry, AuthStats, ServiceCertificate};
