//! Service mesh control plane and resilient API gateway.
//!
//! 管理面挂在 `/mesh` 前缀下，负责注册、配置与观测；
//! 其余请求进入数据面，按路由经过认证、熔断、重试与灰度分流后转发到后端实例。

pub mod config;
pub mod error;
pub mod server;
pub mod services;

pub use error::MeshError;
pub use services::ControlPlane;
