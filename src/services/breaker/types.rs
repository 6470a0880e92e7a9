use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::BreakerDefaults;

/// 熔断器状态
///
/// 同一时刻只处于一个状态，状态迁移只通过定义好的规则发生：
/// Closed --(监控窗口内失败达到阈值)--> Open
/// Open --(打开时长超过 open_timeout)--> HalfOpen
/// HalfOpen --(连续成功达到阈值)--> Closed
/// HalfOpen --(任意一次失败)--> Open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// 单个熔断器的配置，未指定时取全局缺省
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_ms: u64,
    pub monitoring_period_ms: u64,
    pub half_open_max_calls: u32,
}

impl BreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn monitoring_period(&self) -> Duration {
        Duration::from_millis(self.monitoring_period_ms)
    }
}

impl From<&BreakerDefaults> for BreakerConfig {
    fn from(defaults: &BreakerDefaults) -> Self {
        Self {
            failure_threshold: defaults.failure_threshold,
            success_threshold: defaults.success_threshold,
            open_timeout_ms: defaults.open_timeout_ms,
            monitoring_period_ms: defaults.monitoring_period_ms,
            half_open_max_calls: defaults.half_open_max_calls,
        }
    }
}

/// 熔断器内部记录，始终在同一把锁下读写
#[derive(Debug)]
pub struct BreakerEntry {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<Instant>,
    pub last_state_change: Instant,
    // 半开状态下进行中的试探调用数
    pub trial_inflight: u32,
    pub total_calls: u64,
    pub rejected_calls: u64,
    // 累计跳闸次数（迁入 Open 的次数）
    pub trips: u64,
    pub config: BreakerConfig,
}

impl BreakerEntry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_state_change: Instant::now(),
            trial_inflight: 0,
            total_calls: 0,
            rejected_calls: 0,
            trips: 0,
            config,
        }
    }

    /// 执行一次状态迁移并清理相应计数
    pub fn transition(&mut self, next: CircuitState) {
        self.state = next;
        self.last_state_change = Instant::now();
        match next {
            CircuitState::Closed => {
                self.failure_count = 0;
                self.success_count = 0;
                self.last_failure_time = None;
            }
            CircuitState::Open => {
                self.success_count = 0;
                self.trips += 1;
            }
            CircuitState::HalfOpen => {
                self.success_count = 0;
                self.trial_inflight = 0;
            }
        }
    }
}

/// 对外暴露的熔断器快照
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub trips: u64,
    pub since_state_change_ms: u64,
    pub config: BreakerConfig,
}

/// 熔断器统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct BreakerStats {
    pub breakers: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub trips: u64,
}
