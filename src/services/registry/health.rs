use std::sync::Arc;

use futures::future::join_all;
use tokio_util::task::TaskTracker;

use super::service::ServiceRegistry;
use crate::config::RegistryConfig;

/// 主动健康探测器
///
/// 周期性地对注册表里的每个实例发起 HTTP GET 探测，
/// 结果写回注册表：单次成功立即恢复，连续失败达到阈值才剔除。
#[derive(Debug, Clone)]
pub struct HealthProber {
    config: RegistryConfig,
    registry: ServiceRegistry,
    http_client: reqwest::Client,
    task_tracker: Arc<TaskTracker>,
}

impl HealthProber {
    pub fn new(config: RegistryConfig, registry: ServiceRegistry) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.probe_timeout())
            .build()
            .unwrap_or_default();

        Self {
            config,
            registry,
            http_client,
            task_tracker: Arc::new(TaskTracker::new()),
        }
    }

    /// 启动探测循环
    pub fn start(&self) {
        let prober = self.clone();
        let interval_duration = self.config.health_check_interval();

        self.task_tracker.spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            loop {
                interval.tick().await;
                prober.probe_all().await;
            }
        });

        tracing::info!(
            interval_secs = self.config.health_check_interval_secs,
            probe_path = %self.config.probe_path,
            "Health prober started"
        );
    }

    /// 并发探测所有实例
    pub async fn probe_all(&self) {
        let instances = self.registry.all_instances();
        if instances.is_empty() {
            return;
        }

        let probes = instances.into_iter().map(|instance| {
            let prober = self.clone();
            async move {
                let ok = prober.probe_once(&instance.base_url()).await;
                if ok {
                    prober
                        .registry
                        .record_probe_success(&instance.service_name, &instance.id);
                } else {
                    prober
                        .registry
                        .record_probe_failure(&instance.service_name, &instance.id);
                }
            }
        });

        join_all(probes).await;
    }

    /// 单次探测：2xx 为成功，非 2xx、网络错误、超时都算失败
    async fn probe_once(&self, base_url: &str) -> bool {
        let probe_url = format!("{}{}", base_url, self.config.probe_path);

        match tokio::time::timeout(
            self.config.probe_timeout(),
            self.http_client.get(&probe_url).send(),
        )
        .await
        {
            Ok(Ok(response)) => {
                if response.status().is_success() {
                    true
                } else {
                    tracing::debug!(
                        url = %probe_url,
                        status = %response.status(),
                        "Health probe returned non-success status"
                    );
                    false
                }
            }
            Ok(Err(e)) => {
                tracing::debug!(url = %probe_url, error = %e, "Health probe request failed");
                false
            }
            Err(_) => {
                tracing::debug!(url = %probe_url, "Health probe timed out");
                false
            }
        }
    }
}

impl Drop for HealthProber {
    fn drop(&mut self) {
        self.task_tracker.close();
    }
}
