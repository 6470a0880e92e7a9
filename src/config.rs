use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::services::registry::LoadBalancingStrategy;

/// 配置加载/校验错误，启动阶段视为致命错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to read environment overrides: {0}")]
    Env(#[from] envy::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MeshConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub breaker: BreakerDefaults,
    #[serde(default)]
    pub retry: RetryDefaults,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// 未指定策略时使用的负载均衡策略
    pub default_strategy: LoadBalancingStrategy,
    /// 健康检查周期（秒）
    pub health_check_interval_secs: u64,
    /// 单次探测超时（秒）
    pub probe_timeout_secs: u64,
    /// 连续失败多少次后标记为不健康
    pub unhealthy_after: u32,
    /// 探测路径
    pub probe_path: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_strategy: LoadBalancingStrategy::RoundRobin,
            health_check_interval_secs: 15,
            probe_timeout_secs: 3,
            unhealthy_after: 3,
            probe_path: "/health".to_string(),
        }
    }
}

impl RegistryConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// 熔断器默认参数，按名称首次使用时套用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerDefaults {
    /// 监控窗口内的失败阈值
    pub failure_threshold: u32,
    /// 半开状态下连续成功多少次后闭合
    pub success_threshold: u32,
    /// 打开后多久进入半开（毫秒）
    pub open_timeout_ms: u64,
    /// 失败计数的监控窗口（毫秒）
    pub monitoring_period_ms: u64,
    /// 半开状态允许的并发试探数
    pub half_open_max_calls: u32,
}

impl Default for BreakerDefaults {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_ms: 30_000,
            monitoring_period_ms: 60_000,
            half_open_max_calls: 1,
        }
    }
}

/// 未注册策略的操作使用的重试默认值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDefaults {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// 服务证书有效期（秒）
    pub certificate_ttl_secs: u64,
    /// 过期证书清理周期（秒）
    pub cleanup_interval_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            certificate_ttl_secs: 3600,
            cleanup_interval_secs: 300,
        }
    }
}

impl AuthConfig {
    pub fn certificate_ttl(&self) -> Duration {
        Duration::from_secs(self.certificate_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// 单次上游调用的默认超时（毫秒），路由可覆盖
    pub dispatch_timeout_ms: u64,
    /// 响应缓存清理周期（秒）
    pub cache_sweep_interval_secs: u64,
    /// 请求体大小上限（字节）
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout_ms: 5_000,
            cache_sweep_interval_secs: 60,
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

impl GatewayConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs)
    }
}

/// 环境变量覆盖项（MESH_ 前缀），只开放部署时常改的字段
#[derive(Debug, Deserialize)]
struct EnvOverrides {
    listen_addr: Option<String>,
    dispatch_timeout_ms: Option<u64>,
    certificate_ttl_secs: Option<u64>,
    health_check_interval_secs: Option<u64>,
}

impl MeshConfig {
    /// 加载配置：config.toml（存在时）+ MESH_ 环境变量覆盖，最后整体校验。
    /// 文件损坏或校验失败返回错误，由 main 以非零码退出。
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("MESH_CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let mut config = if Path::new(path).exists() {
            let config_str = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_string(),
                source,
            })?;
            toml::from_str(&config_str).map_err(|source| ConfigError::Parse {
                path: path.to_string(),
                source,
            })?
        } else {
            tracing::warn!(path = %path, "Config file not found, using built-in defaults");
            MeshConfig::default()
        };

        let overrides: EnvOverrides = envy::prefixed("MESH_").from_env()?;
        if let Some(addr) = overrides.listen_addr {
            config.server.listen_addr = addr;
        }
        if let Some(ms) = overrides.dispatch_timeout_ms {
            config.gateway.dispatch_timeout_ms = ms;
        }
        if let Some(secs) = overrides.certificate_ttl_secs {
            config.auth.certificate_ttl_secs = secs;
        }
        if let Some(secs) = overrides.health_check_interval_secs {
            config.registry.health_check_interval_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }

    /// 启动时整体校验，失败即致命
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server
            .listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid(format!("server.listen_addr: {e}")))?;

        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.breaker.success_threshold == 0 {
            return Err(ConfigError::Invalid(
                "breaker.success_threshold must be at least 1".to_string(),
            ));
        }
        if self.breaker.half_open_max_calls == 0 {
            return Err(ConfigError::Invalid(
                "breaker.half_open_max_calls must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.registry.unhealthy_after == 0 {
            return Err(ConfigError::Invalid(
                "registry.unhealthy_after must be at least 1".to_string(),
            ));
        }
        if self.auth.certificate_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "auth.certificate_ttl_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_listen_addr_rejected() {
        let mut config = MeshConfig::default();
        config.server.listen_addr = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_thresholds_rejected() {
        let mut config = MeshConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }
}
