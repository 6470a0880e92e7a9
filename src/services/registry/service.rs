use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use uuid::Uuid;

use super::types::{LoadBalancingStrategy, RegistryStats, ServiceInstance};
use crate::config::RegistryConfig;
use crate::error::MeshError;

/// 服务注册表
///
/// 每个服务名对应一组实例；选取只考虑 healthy=true 的实例。
/// 轮询游标与 in-flight 计数由注册表独占维护，其他组件只通过公开方法访问。
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    config: RegistryConfig,
    // 缺省选取策略，可由控制面在运行时切换
    strategy: Arc<RwLock<LoadBalancingStrategy>>,
    // 服务名 -> 实例列表
    services: Arc<DashMap<String, Vec<ServiceInstance>>>,
    // 服务名 -> 轮询游标
    cursors: Arc<DashMap<String, AtomicUsize>>,
    // 实例ID -> 进行中的请求数（least_connections 策略使用）
    inflight: Arc<DashMap<String, Arc<AtomicI64>>>,
    // 实例ID -> 连续探测失败次数
    probe_failures: Arc<DashMap<String, u32>>,
    selections: Arc<AtomicU64>,
    selection_misses: Arc<AtomicU64>,
}

/// in-flight 计数守卫，Drop 时必定递减。
/// 超时或取消的调用同样经过这里释放名额。
#[derive(Debug)]
pub struct InflightGuard {
    counter: Arc<AtomicI64>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let strategy = Arc::new(RwLock::new(config.default_strategy));
        Self {
            config,
            strategy,
            services: Arc::new(DashMap::new()),
            cursors: Arc::new(DashMap::new()),
            inflight: Arc::new(DashMap::new()),
            probe_failures: Arc::new(DashMap::new()),
            selections: Arc::new(AtomicU64::new(0)),
            selection_misses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 注册实例：校验必填字段，缺省ID时分配 UUID，入表即视为健康。
    /// 相同ID重复注册会原地替换。
    pub fn register(&self, mut instance: ServiceInstance) -> Result<ServiceInstance, MeshError> {
        if instance.service_name.is_empty() {
            return Err(MeshError::Validation("service_name is required".to_string()));
        }
        if instance.version.is_empty() {
            return Err(MeshError::Validation("version is required".to_string()));
        }
        if instance.host.is_empty() {
            return Err(MeshError::Validation("host is required".to_string()));
        }
        if instance.port == 0 {
            return Err(MeshError::Validation("port must be non-zero".to_string()));
        }

        if instance.id.is_empty() {
            instance.id = Uuid::new_v4().to_string();
        }
        if instance.weight == 0 {
            instance.weight = 1;
        }
        instance.healthy = true;
        instance.last_health_check = SystemTime::now();

        let stored = instance.clone();
        self.services
            .entry(instance.service_name.clone())
            .and_modify(|list| {
                if let Some(existing) = list.iter_mut().find(|i| i.id == instance.id) {
                    *existing = instance.clone();
                } else {
                    list.push(instance.clone());
                }
            })
            .or_insert_with(|| vec![instance.clone()]);

        tracing::info!(
            service_name = %stored.service_name,
            instance_id = %stored.id,
            address = %stored.base_url(),
            version = %stored.version,
            "Registered service instance"
        );

        Ok(stored)
    }

    /// 注销实例，服务或实例不存在时返回 false
    pub fn deregister(&self, service_name: &str, instance_id: &str) -> bool {
        let mut removed = false;
        let mut service_empty = false;

        if let Some(mut entry) = self.services.get_mut(service_name) {
            let before = entry.len();
            entry.retain(|i| i.id != instance_id);
            removed = entry.len() != before;
            service_empty = entry.is_empty();
        }

        if service_empty {
            self.services.remove(service_name);
            self.cursors.remove(service_name);
        }

        if removed {
            self.inflight.remove(instance_id);
            self.probe_failures.remove(instance_id);
            tracing::info!(
                service_name = %service_name,
                instance_id = %instance_id,
                "Deregistered service instance"
            );
        }
        removed
    }

    /// 按策略在健康实例中选取一个；无健康实例返回 None，
    /// 调用方必须视为服务不可用，不得无限重试。
    pub fn select_instance(
        &self,
        service_name: &str,
        strategy: LoadBalancingStrategy,
    ) -> Option<ServiceInstance> {
        self.select_version_instance(service_name, None, strategy)
    }

    /// 带版本偏好的选取，网关在流量路由决定版本后使用
    pub fn select_version_instance(
        &self,
        service_name: &str,
        version: Option<&str>,
        strategy: LoadBalancingStrategy,
    ) -> Option<ServiceInstance> {
        let candidates: Vec<ServiceInstance> = {
            let entry = self.services.get(service_name)?;
            entry
                .iter()
                .filter(|i| i.healthy)
                .filter(|i| version.is_none_or(|v| i.version == v))
                .cloned()
                .collect()
        };

        if candidates.is_empty() {
            self.selection_misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                service_name = %service_name,
                version = ?version,
                "No healthy instance available"
            );
            return None;
        }

        let picked = match strategy {
            LoadBalancingStrategy::RoundRobin => self.pick_round_robin(service_name, &candidates),
            LoadBalancingStrategy::Weighted => Self::pick_weighted(&candidates),
            LoadBalancingStrategy::LeastConnections => self.pick_least_connections(&candidates),
            LoadBalancingStrategy::Random => {
                candidates[rand::thread_rng().gen_range(0..candidates.len())].clone()
            }
        };

        self.selections.fetch_add(1, Ordering::Relaxed);
        Some(picked)
    }

    fn pick_round_robin(
        &self,
        service_name: &str,
        candidates: &[ServiceInstance],
    ) -> ServiceInstance {
        let index = self
            .cursors
            .entry(service_name.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
        candidates[index % candidates.len()].clone()
    }

    // 权重之和为总票数，随机落点后按权重顺序扣减
    fn pick_weighted(candidates: &[ServiceInstance]) -> ServiceInstance {
        let total_weight: u64 = candidates.iter().map(|i| i.weight as u64).sum();
        let mut point = rand::thread_rng().gen_range(0..total_weight);
        for instance in candidates {
            let weight = instance.weight as u64;
            if point < weight {
                return instance.clone();
            }
            point -= weight;
        }
        candidates[candidates.len() - 1].clone()
    }

    fn pick_least_connections(&self, candidates: &[ServiceInstance]) -> ServiceInstance {
        candidates
            .iter()
            .min_by_key(|i| self.inflight_count(&i.id))
            .cloned()
            .unwrap_or_else(|| candidates[0].clone())
    }

    /// 登记一次进行中的调用，返回的守卫在 Drop 时释放名额
    pub fn track_inflight(&self, instance_id: &str) -> InflightGuard {
        let counter = self
            .inflight
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::Relaxed);
        InflightGuard { counter }
    }

    pub fn inflight_count(&self, instance_id: &str) -> i64 {
        self.inflight
            .get(instance_id)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// 全部实例在途调用数之和
    pub fn total_inflight(&self) -> i64 {
        self.inflight
            .iter()
            .map(|c| c.value().load(Ordering::Relaxed))
            .sum()
    }

    /// 探测成功：单次成功立即恢复健康（快恢复）
    pub fn record_probe_success(&self, service_name: &str, instance_id: &str) {
        self.probe_failures.remove(instance_id);
        if let Some(mut entry) = self.services.get_mut(service_name) {
            if let Some(instance) = entry.iter_mut().find(|i| i.id == instance_id) {
                instance.last_health_check = SystemTime::now();
                if !instance.healthy {
                    instance.healthy = true;
                    tracing::info!(
                        service_name = %service_name,
                        instance_id = %instance_id,
                        "Instance recovered, marking healthy"
                    );
                }
            }
        }
    }

    /// 探测失败：连续失败达到阈值才剔除（慢剔除）
    pub fn record_probe_failure(&self, service_name: &str, instance_id: &str) {
        let failures = {
            let mut entry = self
                .probe_failures
                .entry(instance_id.to_string())
                .or_insert(0);
            *entry += 1;
            *entry
        };

        if let Some(mut entry) = self.services.get_mut(service_name) {
            if let Some(instance) = entry.iter_mut().find(|i| i.id == instance_id) {
                instance.last_health_check = SystemTime::now();
                if failures >= self.config.unhealthy_after && instance.healthy {
                    instance.healthy = false;
                    tracing::warn!(
                        service_name = %service_name,
                        instance_id = %instance_id,
                        consecutive_failures = failures,
                        "Instance marked unhealthy after consecutive probe failures"
                    );
                }
            }
        }
    }

    /// 管理接口的手工健康覆盖
    pub fn set_health(&self, service_name: &str, instance_id: &str, healthy: bool) -> bool {
        self.probe_failures.remove(instance_id);
        if let Some(mut entry) = self.services.get_mut(service_name) {
            if let Some(instance) = entry.iter_mut().find(|i| i.id == instance_id) {
                instance.healthy = healthy;
                instance.last_health_check = SystemTime::now();
                tracing::info!(
                    service_name = %service_name,
                    instance_id = %instance_id,
                    healthy,
                    "Manually updated instance health"
                );
                return true;
            }
        }
        false
    }

    pub fn instances_of(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.services
            .get(service_name)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    pub fn all_instances(&self) -> Vec<ServiceInstance> {
        self.services
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    pub fn default_strategy(&self) -> LoadBalancingStrategy {
        *self
            .strategy
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 切换缺省选取策略，立即对后续选取生效
    pub fn set_default_strategy(&self, strategy: LoadBalancingStrategy) {
        *self
            .strategy
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = strategy;
        tracing::info!(strategy = ?strategy, "Switched default load balancing strategy");
    }

    /// 注册子系统是否可用（控制面健康汇总用）
    pub fn is_operational(&self) -> bool {
        // 纯内存结构，进程在即可用
        true
    }

    pub fn stats(&self) -> RegistryStats {
        let mut instances = 0;
        let mut healthy_instances = 0;
        for entry in self.services.iter() {
            instances += entry.len();
            healthy_instances += entry.iter().filter(|i| i.healthy).count();
        }
        RegistryStats {
            services: self.services.len(),
            instances,
            healthy_instances,
            selections: self.selections.load(Ordering::Relaxed),
            selection_misses: self.selection_misses.load(Ordering::Relaxed),
        }
    }

    /// 清零计数器，不动实例数据
    pub fn reset_stats(&self) {
        self.selections.store(0, Ordering::Relaxed);
        self.selection_misses.store(0, Ordering::Relaxed);
    }
}
