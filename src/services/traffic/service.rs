use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use super::types::{
    CanaryDeployment, CanaryStatus, RuleMatch, TrafficRoute, TrafficStats, bucket_for,
};
use crate::error::MeshError;
use crate::services::auth::types::unix_now;
use crate::services::registry::{ServiceInstance, ServiceRegistry};

/// 流量路由器
///
/// 版本决策顺序：规则集优先，其次金丝雀，都没有则不限版本。
/// 规则集内自上而下第一条命中即生效；每个服务同时只保留一套规则集、
/// 至多一个 Running 状态的金丝雀。
#[derive(Debug, Clone)]
pub struct TrafficRouter {
    registry: ServiceRegistry,
    // 服务名 -> 规则集
    routes: Arc<DashMap<String, TrafficRoute>>,
    // 金丝雀ID -> 发布对象
    canaries: Arc<DashMap<String, CanaryDeployment>>,
    resolutions: Arc<AtomicU64>,
}

impl TrafficRouter {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self {
            registry,
            routes: Arc::new(DashMap::new()),
            canaries: Arc::new(DashMap::new()),
            resolutions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 创建（或替换）某个服务的流量规则集
    pub fn create_route(&self, mut route: TrafficRoute) -> Result<TrafficRoute, MeshError> {
        if route.name.is_empty() {
            return Err(MeshError::Validation("name is required".to_string()));
        }
        if route.service_name.is_empty() {
            return Err(MeshError::Validation(
                "service_name is required".to_string(),
            ));
        }
        if route.rules.is_empty() {
            return Err(MeshError::Validation(
                "at least one rule is required".to_string(),
            ));
        }
        for rule in &route.rules {
            if rule.target_version.is_empty() {
                return Err(MeshError::Validation(
                    "every rule needs a target_version".to_string(),
                ));
            }
            if let RuleMatch::Percentage { percent } = rule.matcher {
                if percent > 100 {
                    return Err(MeshError::Validation(
                        "percentage rule must be within 0..=100".to_string(),
                    ));
                }
            }
        }

        if route.id.is_empty() {
            route.id = Uuid::new_v4().to_string();
        }

        self.routes
            .insert(route.service_name.clone(), route.clone());
        tracing::info!(
            route_id = %route.id,
            route_name = %route.name,
            service_name = %route.service_name,
            rules = route.rules.len(),
            "Created traffic route"
        );
        Ok(route)
    }

    pub fn list_routes(&self) -> Vec<TrafficRoute> {
        self.routes.iter().map(|r| r.value().clone()).collect()
    }

    pub fn remove_route(&self, route_id: &str) -> bool {
        let service = self
            .routes
            .iter()
            .find(|r| r.value().id == route_id)
            .map(|r| r.key().clone());
        match service {
            Some(service) => {
                self.routes.remove(&service);
                tracing::info!(route_id = %route_id, service_name = %service, "Removed traffic route");
                true
            }
            None => false,
        }
    }

    /// 创建金丝雀发布，同一服务不允许并存两个 Running 发布
    pub fn create_canary(
        &self,
        mut deployment: CanaryDeployment,
    ) -> Result<CanaryDeployment, MeshError> {
        if deployment.service_name.is_empty() {
            return Err(MeshError::Validation(
                "service_name is required".to_string(),
            ));
        }
        if deployment.canary_version.is_empty() || deployment.stable_version.is_empty() {
            return Err(MeshError::Validation(
                "canary_version and stable_version are required".to_string(),
            ));
        }
        if deployment.canary_version == deployment.stable_version {
            return Err(MeshError::Validation(
                "canary_version must differ from stable_version".to_string(),
            ));
        }
        if deployment.traffic_percent > 100 {
            return Err(MeshError::Validation(
                "traffic_percent must be within 0..=100".to_string(),
            ));
        }
        let has_running = self.canaries.iter().any(|c| {
            c.value().service_name == deployment.service_name
                && c.value().status == CanaryStatus::Running
        });
        if has_running {
            return Err(MeshError::Validation(format!(
                "service '{}' already has a running canary",
                deployment.service_name
            )));
        }

        deployment.id = Uuid::new_v4().to_string();
        deployment.status = CanaryStatus::Running;
        deployment.metrics = Default::default();
        deployment.created_at = unix_now();

        self.canaries
            .insert(deployment.id.clone(), deployment.clone());
        tracing::info!(
            canary_id = %deployment.id,
            service_name = %deployment.service_name,
            canary_version = %deployment.canary_version,
            stable_version = %deployment.stable_version,
            traffic_percent = deployment.traffic_percent,
            "Created canary deployment"
        );
        Ok(deployment)
    }

    /// 全量切到金丝雀版本并进入终态；已是终态则原样返回，不做任何事
    pub fn promote_canary(&self, id: &str) -> Result<CanaryDeployment, MeshError> {
        let mut entry = self
            .canaries
            .get_mut(id)
            .ok_or_else(|| MeshError::NotFound(format!("canary '{id}' not found")))?;

        if entry.status.is_terminal() {
            tracing::debug!(canary_id = %id, status = ?entry.status, "Ignoring promote on terminal canary");
            return Ok(entry.clone());
        }

        entry.status = CanaryStatus::Promoted;
        entry.traffic_percent = 100;
        tracing::info!(
            canary_id = %id,
            service_name = %entry.service_name,
            canary_version = %entry.canary_version,
            "Promoted canary deployment"
        );
        Ok(entry.clone())
    }

    /// 全量退回稳定版本并进入终态；已是终态则原样返回，不做任何事
    pub fn rollback_canary(&self, id: &str) -> Result<CanaryDeployment, MeshError> {
        let mut entry = self
            .canaries
            .get_mut(id)
            .ok_or_else(|| MeshError::NotFound(format!("canary '{id}' not found")))?;

        if entry.status.is_terminal() {
            tracing::debug!(canary_id = %id, status = ?entry.status, "Ignoring rollback on terminal canary");
            return Ok(entry.clone());
        }

        entry.status = CanaryStatus::RolledBack;
        entry.traffic_percent = 0;
        tracing::info!(
            canary_id = %id,
            service_name = %entry.service_name,
            stable_version = %entry.stable_version,
            "Rolled back canary deployment"
        );
        Ok(entry.clone())
    }

    pub fn get_canary(&self, id: &str) -> Option<CanaryDeployment> {
        self.canaries.get(id).map(|c| c.clone())
    }

    pub fn list_canaries(&self) -> Vec<CanaryDeployment> {
        self.canaries.iter().map(|c| c.value().clone()).collect()
    }

    /// 为一次请求决定版本：规则集 -> 金丝雀 -> 不限版本
    pub fn resolve_version(
        &self,
        service_name: &str,
        headers: &http::HeaderMap,
        routing_key: &str,
    ) -> Option<String> {
        self.resolutions.fetch_add(1, Ordering::Relaxed);

        if let Some(route) = self.routes.get(service_name) {
            if let Some(version) = Self::evaluate_rules(&route, headers, routing_key) {
                tracing::debug!(
                    service_name = %service_name,
                    version = %version,
                    route_name = %route.name,
                    "Traffic rule selected version"
                );
                return Some(version);
            }
        }

        if let Some(version) = self.resolve_canary_version(service_name, routing_key) {
            return Some(version);
        }

        None
    }

    /// 版本决策后直接从注册表选实例，策略取注册表缺省
    pub fn select_instance(
        &self,
        service_name: &str,
        headers: &http::HeaderMap,
        routing_key: &str,
    ) -> Option<ServiceInstance> {
        let version = self.resolve_version(service_name, headers, routing_key);
        self.registry.select_version_instance(
            service_name,
            version.as_deref(),
            self.registry.default_strategy(),
        )
    }

    fn evaluate_rules(
        route: &TrafficRoute,
        headers: &http::HeaderMap,
        routing_key: &str,
    ) -> Option<String> {
        for rule in &route.rules {
            let hit = match &rule.matcher {
                RuleMatch::Header { name, value } => headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v == value),
                RuleMatch::Percentage { percent } => {
                    bucket_for(&route.id, routing_key) < *percent
                }
                RuleMatch::Default => true,
            };
            if hit {
                return Some(rule.target_version.clone());
            }
        }
        None
    }

    // Running 的金丝雀按桶位分流；最近一次终态发布决定当前全量版本
    fn resolve_canary_version(&self, service_name: &str, routing_key: &str) -> Option<String> {
        let mut latest_terminal: Option<CanaryDeployment> = None;

        for entry in self.canaries.iter() {
            let canary = entry.value();
            if canary.service_name != service_name {
                continue;
            }
            match canary.status {
                CanaryStatus::Running => {
                    let version = if bucket_for(&canary.id, routing_key) < canary.traffic_percent {
                        canary.canary_version.clone()
                    } else {
                        canary.stable_version.clone()
                    };
                    tracing::debug!(
                        service_name = %service_name,
                        canary_id = %canary.id,
                        version = %version,
                        "Canary split selected version"
                    );
                    return Some(version);
                }
                _ => {
                    let newer = latest_terminal
                        .as_ref()
                        .is_none_or(|t| canary.created_at > t.created_at);
                    if newer {
                        latest_terminal = Some(canary.clone());
                    }
                }
            }
        }

        latest_terminal.map(|canary| match canary.status {
            CanaryStatus::Promoted => canary.canary_version,
            _ => canary.stable_version,
        })
    }

    /// 把一次调用结果记到所属 Running 金丝雀的观测里
    pub fn record_result(&self, service_name: &str, version: &str, success: bool) {
        for mut entry in self.canaries.iter_mut() {
            let canary = entry.value_mut();
            if canary.service_name != service_name || canary.status != CanaryStatus::Running {
                continue;
            }
            if version == canary.canary_version {
                canary.metrics.canary_requests += 1;
                if !success {
                    canary.metrics.canary_errors += 1;
                }
            } else if version == canary.stable_version {
                canary.metrics.stable_requests += 1;
                if !success {
                    canary.metrics.stable_errors += 1;
                }
            }
            return;
        }
    }

    pub fn stats(&self) -> TrafficStats {
        let running_canaries = self
            .canaries
            .iter()
            .filter(|c| c.value().status == CanaryStatus::Running)
            .count();
        TrafficStats {
            traffic_routes: self.routes.len(),
            canaries: self.canaries.len(),
            running_canaries,
            resolutions: self.resolutions.load(Ordering::Relaxed),
        }
    }

    /// 清零计数与金丝雀观测，规则集和发布对象本身保留
    pub fn reset_stats(&self) {
        self.resolutions.store(0, Ordering::Relaxed);
        for mut entry in self.canaries.iter_mut() {
            entry.value_mut().metrics = Default::default();
        }
    }
}
