use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use super::types::{RetryPolicy, RetryStats};
use crate::config::RetryDefaults;
use crate::error::MeshError;
use crate::services::breaker::CircuitBreakerService;

/// 重试引擎
///
/// 按操作名查表取策略，未注册的操作用全局缺省。
/// 与熔断器强耦合：每次尝试前都要重新查看熔断器状态，
/// Open 立即放弃整个重试循环，不把剩余次数烧在已知故障的依赖上。
#[derive(Debug, Clone)]
pub struct RetryService {
    // 未注册操作的兜底策略参数，可由控制面在运行时调整
    defaults: Arc<RwLock<RetryDefaults>>,
    policies: Arc<DashMap<String, RetryPolicy>>,
    calls: Arc<AtomicU64>,
    retries: Arc<AtomicU64>,
    exhausted: Arc<AtomicU64>,
    aborted_by_breaker: Arc<AtomicU64>,
}

impl RetryService {
    pub fn new(defaults: RetryDefaults) -> Self {
        Self {
            defaults: Arc::new(RwLock::new(defaults)),
            policies: Arc::new(DashMap::new()),
            calls: Arc::new(AtomicU64::new(0)),
            retries: Arc::new(AtomicU64::new(0)),
            exhausted: Arc::new(AtomicU64::new(0)),
            aborted_by_breaker: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 注册或更新某个操作的重试策略
    pub fn register_policy(&self, policy: RetryPolicy) -> Result<RetryPolicy, MeshError> {
        if policy.operation.is_empty() {
            return Err(MeshError::Validation("operation is required".to_string()));
        }
        if policy.max_attempts == 0 {
            return Err(MeshError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if policy.backoff_multiplier < 1.0 {
            return Err(MeshError::Validation(
                "backoff_multiplier must be >= 1.0".to_string(),
            ));
        }

        self.policies
            .insert(policy.operation.clone(), policy.clone());
        tracing::info!(
            operation = %policy.operation,
            max_attempts = policy.max_attempts,
            backoff_base_ms = policy.backoff_base_ms,
            "Registered retry policy"
        );
        Ok(policy)
    }

    /// 取操作的策略，未注册时临时生成缺省策略（不落表）
    pub fn policy_for(&self, operation: &str) -> RetryPolicy {
        self.policies
            .get(operation)
            .map(|p| p.clone())
            .unwrap_or_else(|| RetryPolicy::from_defaults(operation, &self.defaults()))
    }

    pub fn defaults(&self) -> RetryDefaults {
        self.defaults
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// 调整兜底策略参数，只影响没有显式注册策略的操作
    pub fn set_defaults(&self, defaults: RetryDefaults) {
        *self
            .defaults
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = defaults;
        tracing::info!("Updated retry defaults");
    }

    pub fn list_policies(&self) -> Vec<RetryPolicy> {
        self.policies.iter().map(|p| p.value().clone()).collect()
    }

    /// 带重试地执行一次操作
    ///
    /// operation 同时是重试策略和熔断器的键；闭包每次尝试都会被重新调用。
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        breaker: &CircuitBreakerService,
        f: F,
    ) -> Result<T, MeshError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, MeshError>>,
    {
        let policy = self.policy_for(operation);
        self.calls.fetch_add(1, Ordering::Relaxed);

        let mut attempt = 0u32;
        loop {
            attempt += 1;

            // 每次尝试前都要过一遍熔断器
            let permit = match breaker.acquire(operation) {
                Ok(permit) => permit,
                Err(e) => {
                    self.aborted_by_breaker.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        operation = %operation,
                        attempt,
                        "Retry loop aborted, circuit breaker rejected the call"
                    );
                    return Err(e);
                }
            };

            match f().await {
                Ok(value) => {
                    permit.success();
                    if attempt > 1 {
                        tracing::debug!(
                            operation = %operation,
                            attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => {
                    permit.failure();

                    if !policy.is_retryable(&e) {
                        tracing::debug!(
                            operation = %operation,
                            attempt,
                            error = %e,
                            "Error is not retryable, propagating"
                        );
                        return Err(e);
                    }

                    if attempt >= policy.max_attempts {
                        self.exhausted.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            operation = %operation,
                            attempts = attempt,
                            error = %e,
                            "Retry attempts exhausted"
                        );
                        return Err(MeshError::RetryExhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    }

                    let delay = policy.delay_for(attempt);
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        operation = %operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            policies: self.policies.len(),
            calls: self.calls.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            aborted_by_breaker: self.aborted_by_breaker.load(Ordering::Relaxed),
        }
    }

    /// 清零计数器，保留已注册的策略
    pub fn reset_stats(&self) {
        self.calls.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.exhausted.store(0, Ordering::Relaxed);
        self.aborted_by_breaker.store(0, Ordering::Relaxed);
    }
}
