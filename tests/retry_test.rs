use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use mesh_gateway::config::RetryDefaults;
use mesh_gateway::error::MeshError;
use mesh_gateway::services::breaker::{BreakerConfig, CircuitBreakerService};
use mesh_gateway::services::retry::{RetryPolicy, RetryService, RetryableError};

/// 不干扰重试测试的宽松熔断器
fn lenient_breaker() -> CircuitBreakerService {
    CircuitBreakerService::new(BreakerConfig {
        failure_threshold: 1000,
        success_threshold: 1,
        open_timeout_ms: 30_000,
        monitoring_period_ms: 60_000,
        half_open_max_calls: 1,
    })
}

/// 关闭抖动的确定性策略
fn no_jitter_policy(operation: &str, max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        operation: operation.to_string(),
        max_attempts,
        backoff_base_ms: 100,
        backoff_multiplier: 2.0,
        max_backoff_ms: 5_000,
        retryable_errors: vec![
            RetryableError::Timeout,
            RetryableError::UpstreamServerError,
            RetryableError::Network,
        ],
        jitter: false,
    }
}

fn timeout_error() -> MeshError {
    MeshError::GatewayTimeout {
        timeout: Duration::from_millis(50),
    }
}

#[tokio::test]
async fn test_success_on_first_attempt_skips_retries() {
    let retry = RetryService::new(RetryDefaults::default());
    let breaker = lenient_breaker();

    let attempts = AtomicU32::new(0);
    let result = retry
        .execute("fetch-user", &breaker, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, MeshError>(42) }
        })
        .await
        .expect("First attempt should succeed");

    assert_eq!(result, 42);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(retry.stats().retries, 0);
}

#[tokio::test]
async fn test_retries_until_success_with_backoff() {
    let retry = RetryService::new(RetryDefaults::default());
    retry
        .register_policy(no_jitter_policy("fetch-user", 3))
        .expect("Failed to register policy");
    let breaker = lenient_breaker();

    let attempts = AtomicU32::new(0);
    let started = Instant::now();
    let result = retry
        .execute("fetch-user", &breaker, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(timeout_error())
                } else {
                    Ok("ok")
                }
            }
        })
        .await
        .expect("Third attempt should succeed");
    let elapsed = started.elapsed();

    assert_eq!(result, "ok");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    // 两次退避：100ms + 200ms
    assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");
    assert_eq!(retry.stats().retries, 2);
}

#[tokio::test]
async fn test_exhaustion_wraps_last_error() {
    let retry = RetryService::new(RetryDefaults::default());
    let mut policy = no_jitter_policy("fetch-user", 2);
    policy.backoff_base_ms = 10;
    retry
        .register_policy(policy)
        .expect("Failed to register policy");
    let breaker = lenient_breaker();

    let attempts = AtomicU32::new(0);
    let err = retry
        .execute("fetch-user", &breaker, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(timeout_error()) }
        })
        .await
        .expect_err("All attempts should fail");

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    match err {
        MeshError::RetryExhausted {
            operation,
            attempts: reported,
            source,
        } => {
            assert_eq!(operation, "fetch-user");
            assert_eq!(reported, 2);
            assert!(matches!(*source, MeshError::GatewayTimeout { .. }));
        }
        other => panic!("Expected RetryExhausted, got {other:?}"),
    }
    assert_eq!(retry.stats().exhausted, 1);
}

#[tokio::test]
async fn test_non_retryable_error_propagates_immediately() {
    let retry = RetryService::new(RetryDefaults::default());
    retry
        .register_policy(no_jitter_policy("fetch-user", 3))
        .expect("Failed to register policy");
    let breaker = lenient_breaker();

    let attempts = AtomicU32::new(0);
    let err = retry
        .execute("fetch-user", &breaker, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(MeshError::Validation("bad input".to_string())) }
        })
        .await
        .expect_err("Validation error should propagate");

    // 不在可重试清单里的错误原样返回，只消耗一次尝试
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(matches!(err, MeshError::Validation(_)));
    assert_eq!(retry.stats().retries, 0);
}

#[tokio::test]
async fn test_restricted_retryable_list_is_honored() {
    let retry = RetryService::new(RetryDefaults::default());
    let mut policy = no_jitter_policy("fetch-user", 3);
    policy.retryable_errors = vec![RetryableError::Network];
    retry
        .register_policy(policy)
        .expect("Failed to register policy");
    let breaker = lenient_breaker();

    // 超时不在清单里，不应触发重试
    let attempts = AtomicU32::new(0);
    let err = retry
        .execute("fetch-user", &breaker, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(timeout_error()) }
        })
        .await
        .expect_err("Timeout should not be retried");

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(matches!(err, MeshError::GatewayTimeout { .. }));
}

#[test]
fn test_backoff_schedule_respects_cap() {
    let mut policy = no_jitter_policy("fetch-user", 5);
    policy.max_backoff_ms = 150;

    assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    // 100 * 2 = 200 超过上限，封顶到 150
    assert_eq!(policy.delay_for(2), Duration::from_millis(150));
    assert_eq!(policy.delay_for(3), Duration::from_millis(150));
}

#[test]
fn test_jitter_stays_within_half_of_delay() {
    let policy = RetryPolicy {
        jitter: true,
        ..no_jitter_policy("fetch-user", 3)
    };

    // 抖动范围是 ±50%，基础值 100ms 时应落在 [50, 150]
    for _ in 0..50 {
        let delay = policy.delay_for(1);
        assert!(delay >= Duration::from_millis(50), "delay {delay:?}");
        assert!(delay <= Duration::from_millis(150), "delay {delay:?}");
    }
}

#[tokio::test]
async fn test_open_breaker_aborts_retry_loop() {
    let retry = RetryService::new(RetryDefaults::default());
    let mut policy = no_jitter_policy("fetch-user", 5);
    policy.backoff_base_ms = 10;
    retry
        .register_policy(policy)
        .expect("Failed to register policy");

    // 一次失败就打开
    let breaker = CircuitBreakerService::new(BreakerConfig {
        failure_threshold: 1,
        success_threshold: 1,
        open_timeout_ms: 30_000,
        monitoring_period_ms: 60_000,
        half_open_max_calls: 1,
    });

    let attempts = AtomicU32::new(0);
    let err = retry
        .execute("fetch-user", &breaker, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(timeout_error()) }
        })
        .await
        .expect_err("Open breaker should cut the loop short");

    // 第一次失败打开熔断器，第二次尝试直接被拒，闭包只跑了一次
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(matches!(err, MeshError::CircuitOpen { .. }));
    assert_eq!(retry.stats().aborted_by_breaker, 1);
}

#[test]
fn test_policy_registration_validation() {
    let retry = RetryService::new(RetryDefaults::default());

    let err = retry
        .register_policy(no_jitter_policy("", 3))
        .expect_err("Empty operation should be rejected");
    assert!(matches!(err, MeshError::Validation(_)));

    let err = retry
        .register_policy(no_jitter_policy("fetch-user", 0))
        .expect_err("Zero attempts should be rejected");
    assert!(matches!(err, MeshError::Validation(_)));

    let mut bad_multiplier = no_jitter_policy("fetch-user", 3);
    bad_multiplier.backoff_multiplier = 0.5;
    let err = retry
        .register_policy(bad_multiplier)
        .expect_err("Multiplier below 1.0 should be rejected");
    assert!(matches!(err, MeshError::Validation(_)));
}

#[test]
fn test_unregistered_operation_uses_defaults() {
    let defaults = RetryDefaults {
        max_attempts: 7,
        ..RetryDefaults::default()
    };
    let retry = RetryService::new(defaults);

    let policy = retry.policy_for("never-registered");
    assert_eq!(policy.max_attempts, 7);
    // 临时策略不落进注册表
    assert!(retry.list_policies().is_empty());
}
