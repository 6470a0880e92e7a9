use dashmap::DashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use super::types::{BreakerConfig, BreakerEntry, BreakerSnapshot, BreakerStats, CircuitState};
use crate::error::MeshError;

/// 熔断器服务
///
/// 按名字维护相互独立的熔断器，首次使用时以缺省配置惰性创建。
/// 每个熔断器的记录由自己的互斥锁保护，锁只在同步临界区内持有，
/// 绝不跨越 await 点。
#[derive(Debug, Clone)]
pub struct CircuitBreakerService {
    // 新建熔断器用的缺省配置，可由控制面在运行时调整
    defaults: Arc<RwLock<BreakerConfig>>,
    breakers: Arc<DashMap<String, Arc<Mutex<BreakerEntry>>>>,
}

/// 放行凭证
///
/// acquire 成功后拿到凭证，调用完成时必须用 success/failure 回报结果；
/// 既不回报也不丢弃是不可能的：凭证被 Drop 时会释放半开试探名额，
/// 保证取消或超时的调用不会永久占用席位。
#[derive(Debug)]
pub struct CallPermit {
    name: String,
    entry: Arc<Mutex<BreakerEntry>>,
    trial: bool,
    settled: bool,
}

// 锁中毒时取回内部数据继续使用，熔断记录没有需要保护的中间不变量
fn lock_entry(entry: &Mutex<BreakerEntry>) -> MutexGuard<'_, BreakerEntry> {
    entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CircuitBreakerService {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults: Arc::new(RwLock::new(defaults)),
            breakers: Arc::new(DashMap::new()),
        }
    }

    pub fn defaults(&self) -> BreakerConfig {
        self.defaults
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// 调整缺省配置，只影响此后新建的熔断器
    pub fn set_defaults(&self, defaults: BreakerConfig) {
        *self
            .defaults
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = defaults;
        tracing::info!("Updated circuit breaker defaults");
    }

    /// 取出或创建指定名字的熔断器
    fn ensure(&self, name: &str, config: Option<BreakerConfig>) -> Arc<Mutex<BreakerEntry>> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = config.unwrap_or_else(|| self.defaults());
                tracing::debug!(breaker = %name, "Created circuit breaker with lazy defaults");
                Arc::new(Mutex::new(BreakerEntry::new(config)))
            })
            .clone()
    }

    /// 申请放行一次调用
    ///
    /// Open 状态直接拒绝（fail-fast，不触碰被保护的调用），
    /// 超过打开时长则先迁移到 HalfOpen 再按试探名额放行。
    pub fn acquire(&self, name: &str) -> Result<CallPermit, MeshError> {
        self.acquire_with(name, None)
    }

    pub fn acquire_with(
        &self,
        name: &str,
        config: Option<BreakerConfig>,
    ) -> Result<CallPermit, MeshError> {
        let entry_arc = self.ensure(name, config);
        let mut entry = lock_entry(&entry_arc);
        entry.total_calls += 1;

        if entry.state == CircuitState::Open {
            let elapsed = entry.last_state_change.elapsed();
            let open_timeout = entry.config.open_timeout();
            if elapsed >= open_timeout {
                entry.transition(CircuitState::HalfOpen);
                tracing::info!(breaker = %name, "Circuit breaker entering half-open state");
            } else {
                entry.rejected_calls += 1;
                return Err(MeshError::CircuitOpen {
                    name: name.to_string(),
                    retry_after: open_timeout - elapsed,
                });
            }
        }

        let trial = match entry.state {
            CircuitState::HalfOpen => {
                // 试探并发受限，超出的调用与 Open 同样拒绝
                if entry.trial_inflight >= entry.config.half_open_max_calls {
                    entry.rejected_calls += 1;
                    return Err(MeshError::CircuitOpen {
                        name: name.to_string(),
                        retry_after: entry.config.open_timeout(),
                    });
                }
                entry.trial_inflight += 1;
                true
            }
            _ => false,
        };

        drop(entry);
        Ok(CallPermit {
            name: name.to_string(),
            entry: entry_arc,
            trial,
            settled: false,
        })
    }

    /// 用熔断器包住一次异步调用：Open 时不执行 operation 直接报错，
    /// 否则按执行结果更新计数
    pub async fn execute<T, F, Fut>(
        &self,
        name: &str,
        config: Option<BreakerConfig>,
        operation: F,
    ) -> Result<T, MeshError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, MeshError>>,
    {
        let permit = self.acquire_with(name, config)?;
        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(e)
            }
        }
    }

    /// 当前状态，熔断器不存在时返回 None
    pub fn state(&self, name: &str) -> Option<CircuitState> {
        self.breakers
            .get(name)
            .map(|entry| lock_entry(entry.value()).state)
    }

    /// 为指定名字设置配置；已存在的熔断器原地更新，不打断当前状态
    pub fn configure(&self, name: &str, config: BreakerConfig) {
        let entry_arc = self.ensure(name, Some(config.clone()));
        let mut entry = lock_entry(&entry_arc);
        entry.config = config;
        tracing::info!(breaker = %name, "Updated circuit breaker config");
    }

    pub fn snapshot(&self, name: &str) -> Option<BreakerSnapshot> {
        self.breakers.get(name).map(|entry_arc| {
            let entry = lock_entry(entry_arc.value());
            Self::snapshot_entry(name, &entry)
        })
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|item| {
                let entry = lock_entry(item.value());
                Self::snapshot_entry(item.key(), &entry)
            })
            .collect()
    }

    fn snapshot_entry(name: &str, entry: &BreakerEntry) -> BreakerSnapshot {
        BreakerSnapshot {
            name: name.to_string(),
            state: entry.state,
            failure_count: entry.failure_count,
            success_count: entry.success_count,
            total_calls: entry.total_calls,
            rejected_calls: entry.rejected_calls,
            trips: entry.trips,
            since_state_change_ms: entry.last_state_change.elapsed().as_millis() as u64,
            config: entry.config.clone(),
        }
    }

    /// 把指定熔断器复位到 Closed，保留配置
    pub fn reset(&self, name: &str) -> bool {
        match self.breakers.get(name) {
            Some(entry_arc) => {
                let mut entry = lock_entry(entry_arc.value());
                entry.transition(CircuitState::Closed);
                entry.trial_inflight = 0;
                tracing::info!(breaker = %name, "Circuit breaker reset to closed");
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for item in self.breakers.iter() {
            let mut entry = lock_entry(item.value());
            entry.transition(CircuitState::Closed);
            entry.trial_inflight = 0;
        }
        tracing::info!(count = self.breakers.len(), "All circuit breakers reset");
    }

    /// 只清零调用计数，不改变状态机
    pub fn reset_stats(&self) {
        for item in self.breakers.iter() {
            let mut entry = lock_entry(item.value());
            entry.total_calls = 0;
            entry.rejected_calls = 0;
            entry.trips = 0;
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let mut stats = BreakerStats {
            breakers: self.breakers.len(),
            ..Default::default()
        };
        for item in self.breakers.iter() {
            let entry = lock_entry(item.value());
            match entry.state {
                CircuitState::Closed => stats.closed += 1,
                CircuitState::Open => stats.open += 1,
                CircuitState::HalfOpen => stats.half_open += 1,
            }
            stats.total_calls += entry.total_calls;
            stats.rejected_calls += entry.rejected_calls;
            stats.trips += entry.trips;
        }
        stats
    }
}

impl CallPermit {
    /// 回报成功
    pub fn success(mut self) {
        self.settle(Some(true));
    }

    /// 回报失败
    pub fn failure(mut self) {
        self.settle(Some(false));
    }

    fn settle(&mut self, outcome: Option<bool>) {
        if self.settled {
            return;
        }
        self.settled = true;

        let mut entry = lock_entry(&self.entry);
        if self.trial {
            entry.trial_inflight = entry.trial_inflight.saturating_sub(1);
        }

        match outcome {
            Some(true) => Self::on_success(&self.name, &mut entry),
            Some(false) => Self::on_failure(&self.name, &mut entry),
            // 调用被取消：只释放名额，不计入任何一方
            None => {}
        }
    }

    fn on_success(name: &str, entry: &mut BreakerEntry) {
        match entry.state {
            CircuitState::HalfOpen => {
                entry.success_count += 1;
                if entry.success_count >= entry.config.success_threshold {
                    entry.transition(CircuitState::Closed);
                    tracing::info!(
                        breaker = %name,
                        "Circuit breaker closed after successful trial calls"
                    );
                }
            }
            CircuitState::Closed => {
                entry.failure_count = 0;
                entry.last_failure_time = None;
            }
            // 状态已在别的调用结果下翻转，迟到的结果不再参与决策
            CircuitState::Open => {}
        }
    }

    fn on_failure(name: &str, entry: &mut BreakerEntry) {
        match entry.state {
            CircuitState::HalfOpen => {
                entry.transition(CircuitState::Open);
                tracing::warn!(
                    breaker = %name,
                    "Circuit breaker reopened after failed trial call"
                );
            }
            CircuitState::Closed => {
                // 监控窗口外的旧失败不参与累计
                let within_window = entry
                    .last_failure_time
                    .map(|t| t.elapsed() <= entry.config.monitoring_period())
                    .unwrap_or(false);
                entry.failure_count = if within_window {
                    entry.failure_count + 1
                } else {
                    1
                };
                entry.last_failure_time = Some(std::time::Instant::now());

                if entry.failure_count >= entry.config.failure_threshold {
                    let failures = entry.failure_count;
                    entry.transition(CircuitState::Open);
                    tracing::warn!(
                        breaker = %name,
                        failures,
                        "Circuit breaker opened after reaching failure threshold"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        self.settle(None);
    }
}
