use serde::{Deserialize, Serialize};

use crate::config::{BreakerDefaults, RetryDefaults};
use crate::services::auth::AuthStats;
use crate::services::breaker::{BreakerSnapshot, BreakerStats};
use crate::services::gateway::GatewayStats;
use crate::services::registry::{LoadBalancingStrategy, RegistryStats};
use crate::services::retry::RetryStats;
use crate::services::traffic::TrafficStats;

/// 控制面可在运行时调整的全局设置
#[derive(Debug, Clone, Serialize)]
pub struct MeshSettings {
    pub load_balancing_strategy: LoadBalancingStrategy,
    pub breaker: BreakerDefaults,
    pub retry: RetryDefaults,
    pub dispatch_timeout_ms: u64,
    pub certificate_ttl_secs: u64,
}

/// 部分更新：只带出现的字段，缺席的字段保持现状
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub load_balancing_strategy: Option<LoadBalancingStrategy>,
    pub breaker: Option<BreakerDefaults>,
    pub retry: Option<RetryDefaults>,
    pub dispatch_timeout_ms: Option<u64>,
    pub certificate_ttl_secs: Option<u64>,
}

/// 各子系统统计的汇总
#[derive(Debug, Clone, Serialize)]
pub struct MeshStats {
    pub uptime_secs: u64,
    pub registry: RegistryStats,
    pub breakers: BreakerStats,
    pub breaker_details: Vec<BreakerSnapshot>,
    pub retry: RetryStats,
    pub auth: AuthStats,
    pub traffic: TrafficStats,
    pub gateway: GatewayStats,
}

/// 聚合健康状态
#[derive(Debug, Clone, Serialize)]
pub struct MeshHealth {
    pub status: String,
    pub registry_operational: bool,
    pub auth_operational: bool,
    pub uptime_secs: u64,
}
