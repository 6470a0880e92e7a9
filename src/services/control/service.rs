use std::sync::{Arc, RwLock};
use std::time::Instant;

use super::types::{MeshHealth, MeshSettings, MeshStats, SettingsUpdate};
use crate::config::MeshConfig;
use crate::services::auth::AuthService;
use crate::services::breaker::{BreakerConfig, CircuitBreakerService};
use crate::services::gateway::ApiGateway;
use crate::services::registry::{HealthProber, ServiceRegistry};
use crate::services::retry::RetryService;
use crate::services::traffic::TrafficRouter;

/// 控制面
///
/// 按依赖顺序一次性创建所有子系统并持有句柄；子系统内部状态
/// 仍归各自所有，控制面只做配置下发、统计汇总和健康汇总。
#[derive(Debug, Clone)]
pub struct ControlPlane {
    settings: Arc<RwLock<MeshSettings>>,
    registry: ServiceRegistry,
    prober: HealthProber,
    breaker: CircuitBreakerService,
    retry: RetryService,
    auth: AuthService,
    traffic: TrafficRouter,
    gateway: ApiGateway,
    started_at: Instant,
}

impl ControlPlane {
    /// 依赖顺序：注册表 -> 熔断 / 重试 / 认证 -> 流量路由 -> 网关
    pub fn new(config: &MeshConfig) -> Self {
        let registry = ServiceRegistry::new(config.registry.clone());
        let prober = HealthProber::new(config.registry.clone(), registry.clone());
        let breaker = CircuitBreakerService::new(BreakerConfig::from(&config.breaker));
        let retry = RetryService::new(config.retry.clone());
        let auth = AuthService::new(config.auth.clone());
        let traffic = TrafficRouter::new(registry.clone());
        let gateway = ApiGateway::new(
            config.gateway.clone(),
            registry.clone(),
            breaker.clone(),
            retry.clone(),
            auth.clone(),
            traffic.clone(),
        );

        let settings = MeshSettings {
            load_balancing_strategy: config.registry.default_strategy,
            breaker: config.breaker.clone(),
            retry: config.retry.clone(),
            dispatch_timeout_ms: config.gateway.dispatch_timeout_ms,
            certificate_ttl_secs: config.auth.certificate_ttl_secs,
        };

        Self {
            settings: Arc::new(RwLock::new(settings)),
            registry,
            prober,
            breaker,
            retry,
            auth,
            traffic,
            gateway,
            started_at: Instant::now(),
        }
    }

    /// 启动所有后台任务：健康探测、证书清理、缓存清扫
    pub fn start(&self) {
        self.prober.start();
        self.auth.start();
        self.gateway.start();
        tracing::info!("Control plane background tasks started");
    }

    pub fn settings(&self) -> MeshSettings {
        self.settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// 应用部分更新并下发到相关子系统，返回更新后的完整设置
    pub fn update_settings(&self, update: SettingsUpdate) -> MeshSettings {
        let mut settings = self
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(strategy) = update.load_balancing_strategy {
            settings.load_balancing_strategy = strategy;
            self.registry.set_default_strategy(strategy);
        }
        if let Some(breaker) = update.breaker {
            self.breaker.set_defaults(BreakerConfig::from(&breaker));
            settings.breaker = breaker;
        }
        if let Some(retry) = update.retry {
            self.retry.set_defaults(retry.clone());
            settings.retry = retry;
        }
        if let Some(timeout_ms) = update.dispatch_timeout_ms {
            self.gateway.set_dispatch_timeout_ms(timeout_ms);
            settings.dispatch_timeout_ms = timeout_ms;
        }
        if let Some(ttl_secs) = update.certificate_ttl_secs {
            self.auth.set_certificate_ttl_secs(ttl_secs);
            settings.certificate_ttl_secs = ttl_secs;
        }

        tracing::info!(
            strategy = ?settings.load_balancing_strategy,
            "Applied mesh settings update"
        );
        settings.clone()
    }

    /// 汇总各子系统的统计
    pub fn stats(&self) -> MeshStats {
        MeshStats {
            uptime_secs: self.started_at.elapsed().as_secs(),
            registry: self.registry.stats(),
            breakers: self.breaker.stats(),
            breaker_details: self.breaker.snapshots(),
            retry: self.retry.stats(),
            auth: self.auth.stats(),
            traffic: self.traffic.stats(),
            gateway: self.gateway.stats(),
        }
    }

    /// 清零所有计数器；实例、路由、ACL 等结构性状态一律保留
    pub fn reset_all_stats(&self) {
        self.registry.reset_stats();
        self.breaker.reset_stats();
        self.retry.reset_stats();
        self.auth.reset_stats();
        self.traffic.reset_stats();
        self.gateway.reset_stats();
        tracing::info!("All mesh statistics reset");
    }

    pub fn health(&self) -> MeshHealth {
        let registry_operational = self.registry.is_operational();
        let auth_operational = self.auth.is_operational();
        let status = if registry_operational && auth_operational {
            "ok"
        } else {
            "degraded"
        };
        MeshHealth {
            status: status.to_string(),
            registry_operational,
            auth_operational,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn breaker(&self) -> &CircuitBreakerService {
        &self.breaker
    }

    pub fn retry(&self) -> &RetryService {
        &self.retry
    }

    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    pub fn traffic(&self) -> &TrafficRouter {
        &self.traffic
    }

    pub fn gateway(&self) -> &ApiGateway {
        &self.gateway
    }
}
