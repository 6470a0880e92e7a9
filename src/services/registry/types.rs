use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

// 服务实例注册信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// 实例ID，注册时为空则由注册表分配 UUID
    #[serde(default)]
    pub id: String,
    pub service_name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// 加权策略使用的权重，0 视为 1
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    #[serde(default = "SystemTime::now")]
    pub last_health_check: SystemTime,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_weight() -> u32 {
    1
}

fn default_healthy() -> bool {
    true
}

impl ServiceInstance {
    /// 实例的基础地址，如 http://10.0.0.1:8080
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

// 负载均衡策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    Weighted,
    LeastConnections,
    Random,
}

// 注册表统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub services: usize,
    pub instances: usize,
    pub healthy_instances: usize,
    /// 成功选取实例的次数
    pub selections: u64,
    /// 无健康实例可选的次数
    pub selection_misses: u64,
}
