use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// 把路由键映射到 0..100 的稳定桶位
///
/// 同一 salt + 同一路由键永远落在同一个桶里，这是会话亲和的基础；
/// 不同 salt（不同路由/金丝雀）各自独立分布。
pub fn bucket_for(salt: &str, routing_key: &str) -> u8 {
    let mut hasher = DefaultHasher::new();
    salt.hash(&mut hasher);
    routing_key.hash(&mut hasher);
    (hasher.finish() % 100) as u8
}

/// 流量规则的匹配条件，封闭枚举，求值时穷尽匹配不留暗门
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleMatch {
    /// 请求头等值匹配
    Header { name: String, value: String },
    /// 路由键稳定哈希分桶，桶位小于 percent 即命中
    Percentage { percent: u8 },
    /// 兜底规则
    Default,
}

/// 单条流量规则：条件 -> 目标版本
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRule {
    #[serde(rename = "match")]
    pub matcher: RuleMatch,
    pub target_version: String,
}

/// 一个服务的有序规则集，自上而下第一条命中即生效
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRoute {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub service_name: String,
    pub rules: Vec<TrafficRule>,
}

/// 金丝雀发布状态，Promoted 与 RolledBack 是终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryStatus {
    Running,
    Promoted,
    RolledBack,
}

impl CanaryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CanaryStatus::Running)
    }
}

fn default_canary_status() -> CanaryStatus {
    CanaryStatus::Running
}

/// 金丝雀发布的流量观测
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanaryMetrics {
    pub canary_requests: u64,
    pub stable_requests: u64,
    pub canary_errors: u64,
    pub stable_errors: u64,
}

/// 金丝雀发布
///
/// traffic_percent% 的路由键落到 canary_version，其余落到 stable_version；
/// 同一路由键在发布的整个生命周期内固定落点。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryDeployment {
    #[serde(default)]
    pub id: String,
    pub service_name: String,
    pub canary_version: String,
    pub stable_version: String,
    pub traffic_percent: u8,
    #[serde(default = "default_canary_status")]
    pub status: CanaryStatus,
    #[serde(default)]
    pub metrics: CanaryMetrics,
    #[serde(default)]
    pub created_at: u64,
}

/// 流量路由统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrafficStats {
    pub traffic_routes: usize,
    pub canaries: usize,
    pub running_canaries: usize,
    pub resolutions: u64,
}
