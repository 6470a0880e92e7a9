use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RetryDefaults;
use crate::error::MeshError;

// 抖动幅度，实际延迟在 [0.5x, 1.5x] 区间内
const JITTER_FACTOR: f64 = 0.5;

/// 可重试的错误类别，封闭枚举，未列出的错误一律立即传播
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryableError {
    /// 单次尝试超时
    Timeout,
    /// 上游返回 5xx
    UpstreamServerError,
    /// 连接建立或传输层错误
    Network,
}

impl RetryableError {
    pub fn matches(&self, error: &MeshError) -> bool {
        match self {
            RetryableError::Timeout => matches!(error, MeshError::GatewayTimeout { .. }),
            RetryableError::UpstreamServerError => {
                matches!(error, MeshError::Upstream { status } if *status >= 500)
            }
            RetryableError::Network => matches!(error, MeshError::Network(_)),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_jitter() -> bool {
    true
}

fn default_retryable_errors() -> Vec<RetryableError> {
    vec![
        RetryableError::Timeout,
        RetryableError::UpstreamServerError,
        RetryableError::Network,
    ]
}

/// 某个操作的重试策略，静态配置，每次调用时查表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub operation: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_retryable_errors")]
    pub retryable_errors: Vec<RetryableError>,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl RetryPolicy {
    /// 用全局缺省为指定操作生成策略
    pub fn from_defaults(operation: &str, defaults: &RetryDefaults) -> Self {
        Self {
            operation: operation.to_string(),
            max_attempts: defaults.max_attempts,
            backoff_base_ms: defaults.backoff_base_ms,
            backoff_multiplier: defaults.backoff_multiplier,
            max_backoff_ms: defaults.max_backoff_ms,
            retryable_errors: default_retryable_errors(),
            jitter: defaults.jitter,
        }
    }

    pub fn is_retryable(&self, error: &MeshError) -> bool {
        self.retryable_errors.iter().any(|kind| kind.matches(error))
    }

    /// 第 attempt 次尝试失败后的等待时长：
    /// min(base × multiplier^(attempt−1), max)，可选抖动
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self.backoff_base_ms as f64
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);
        let capped = exponential.min(self.max_backoff_ms as f64);

        let final_ms = if self.jitter {
            let jitter = capped * JITTER_FACTOR * (rand::random::<f64>() * 2.0 - 1.0);
            (capped + jitter).max(1.0)
        } else {
            capped
        };

        Duration::from_millis(final_ms as u64)
    }
}

/// 重试引擎统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryStats {
    pub policies: usize,
    pub calls: u64,
    pub retries: u64,
    pub exhausted: u64,
    pub aborted_by_breaker: u64,
}
