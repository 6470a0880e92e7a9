use http::StatusCode;
use std::time::Duration;

/// 服务网格统一错误类型
///
/// 网关边界将所有子系统错误翻译为该类型，再映射为对外的 HTTP 状态码；
/// 原始错误细节只进入服务端日志，不返回给调用方。
#[derive(Debug, Clone, thiserror::Error)]
pub enum MeshError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// 服务已注册但没有任何健康实例
    #[error("Service '{service_name}' has no healthy instance")]
    Unavailable { service_name: String },

    /// 熔断器处于打开状态，快速拒绝（不调用下游）
    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String, retry_after: Duration },

    /// 重试次数耗尽，包装最后一次失败
    #[error("Operation '{operation}' failed after {attempts} attempts: {source}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<MeshError>,
    },

    #[error("Certificate expired for service '{service_name}'")]
    CertificateExpired { service_name: String },

    #[error("Certificate is invalid or unknown")]
    CertificateInvalid,

    /// ACL 拒绝（包括缺省拒绝）
    #[error("Service '{source_service}' is not allowed to call '{target_service}' ({permission})")]
    AccessDenied {
        source_service: String,
        target_service: String,
        permission: String,
    },

    /// 单次调用超出 per-attempt 截止时间
    #[error("Upstream call timed out after {timeout:?}")]
    GatewayTimeout { timeout: Duration },

    /// 下游返回 5xx
    #[error("Upstream returned status {status}")]
    Upstream { status: u16 },

    /// 连接层失败（连接拒绝、DNS 失败等）
    #[error("Network error: {0}")]
    Network(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeshError {
    /// 剥离重试包装，取最内层的根因
    pub fn root_cause(&self) -> &MeshError {
        match self {
            MeshError::RetryExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// 映射为对外 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            MeshError::Validation(_) => StatusCode::BAD_REQUEST,
            MeshError::NotFound(_) => StatusCode::NOT_FOUND,
            MeshError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            MeshError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            // 根因是超时则 504，其余一律 502
            MeshError::RetryExhausted { source, .. } => match source.root_cause() {
                MeshError::GatewayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                MeshError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            },
            MeshError::CertificateExpired { .. } | MeshError::CertificateInvalid => {
                StatusCode::UNAUTHORIZED
            }
            MeshError::AccessDenied { .. } => StatusCode::FORBIDDEN,
            MeshError::GatewayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            MeshError::Upstream { .. } | MeshError::Network(_) => StatusCode::BAD_GATEWAY,
            MeshError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 错误分类名，进入响应信封的 error 字段
    pub fn kind(&self) -> &'static str {
        match self {
            MeshError::Validation(_) => "validation",
            MeshError::NotFound(_) => "not_found",
            MeshError::Unavailable { .. } => "unavailable",
            MeshError::CircuitOpen { .. } => "circuit_open",
            MeshError::RetryExhausted { .. } => "retry_exhausted",
            MeshError::CertificateExpired { .. } => "certificate_expired",
            MeshError::CertificateInvalid => "certificate_invalid",
            MeshError::AccessDenied { .. } => "access_denied",
            MeshError::GatewayTimeout { .. } => "gateway_timeout",
            MeshError::Upstream { .. } => "upstream_error",
            MeshError::Network(_) => "network_error",
            MeshError::Internal(_) => "internal",
        }
    }

    /// 熔断器给出的重试提示（秒），用于 retry-after 响应头
    pub fn retry_after_hint(&self) -> Option<u64> {
        match self.root_cause() {
            MeshError::CircuitOpen { retry_after, .. } => {
                Some(retry_after.as_secs().max(1))
            }
            _ => None,
        }
    }
}
