use std::collections::HashMap;
use std::time::SystemTime;

use http::HeaderMap;

use mesh_gateway::config::RegistryConfig;
use mesh_gateway::error::MeshError;
use mesh_gateway::services::registry::{ServiceInstance, ServiceRegistry};
use mesh_gateway::services::traffic::{
    CanaryDeployment, CanaryMetrics, CanaryStatus, RuleMatch, TrafficRoute, TrafficRouter,
    TrafficRule,
};

fn router() -> TrafficRouter {
    TrafficRouter::new(ServiceRegistry::new(RegistryConfig::default()))
}

fn route(service_name: &str, rules: Vec<TrafficRule>) -> TrafficRoute {
    TrafficRoute {
        id: String::new(),
        name: format!("{service_name}-rules"),
        service_name: service_name.to_string(),
        rules,
    }
}

fn canary(service_name: &str, percent: u8) -> CanaryDeployment {
    CanaryDeployment {
        id: String::new(),
        service_name: service_name.to_string(),
        canary_version: "v2".to_string(),
        stable_version: "v1".to_string(),
        traffic_percent: percent,
        status: CanaryStatus::Running,
        metrics: CanaryMetrics::default(),
        created_at: 0,
    }
}

fn instance(service_name: &str, version: &str, port: u16) -> ServiceInstance {
    ServiceInstance {
        id: String::new(),
        service_name: service_name.to_string(),
        version: version.to_string(),
        host: "127.0.0.1".to_string(),
        port,
        protocol: "http".to_string(),
        weight: 1,
        healthy: true,
        last_health_check: SystemTime::now(),
        tags: Vec::new(),
        metadata: HashMap::new(),
    }
}

#[test]
fn test_header_rule_selects_version() {
    let traffic = router();
    traffic
        .create_route(route(
            "user-service",
            vec![TrafficRule {
                matcher: RuleMatch::Header {
                    name: "x-beta".to_string(),
                    value: "true".to_string(),
                },
                target_version: "v2".to_string(),
            }],
        ))
        .expect("Failed to create route");

    let mut beta_headers = HeaderMap::new();
    beta_headers.insert("x-beta", "true".parse().expect("Invalid header value"));

    assert_eq!(
        traffic.resolve_version("user-service", &beta_headers, "key-1"),
        Some("v2".to_string())
    );

    // 头不匹配且没有兜底规则时不给版本偏好
    let empty = HeaderMap::new();
    assert_eq!(traffic.resolve_version("user-service", &empty, "key-1"), None);
}

#[test]
fn test_rules_evaluate_in_order_first_match_wins() {
    let traffic = router();
    traffic
        .create_route(route(
            "user-service",
            vec![
                TrafficRule {
                    matcher: RuleMatch::Header {
                        name: "x-beta".to_string(),
                        value: "true".to_string(),
                    },
                    target_version: "v3".to_string(),
                },
                TrafficRule {
                    matcher: RuleMatch::Default,
                    target_version: "v1".to_string(),
                },
            ],
        ))
        .expect("Failed to create route");

    let mut beta_headers = HeaderMap::new();
    beta_headers.insert("x-beta", "true".parse().expect("Invalid header value"));
    assert_eq!(
        traffic.resolve_version("user-service", &beta_headers, "key-1"),
        Some("v3".to_string())
    );

    // 前面的规则不命中时落到兜底
    let empty = HeaderMap::new();
    assert_eq!(
        traffic.resolve_version("user-service", &empty, "key-1"),
        Some("v1".to_string())
    );
}

#[test]
fn test_percentage_rule_is_sticky_per_key() {
    let traffic = router();
    traffic
        .create_route(route(
            "user-service",
            vec![
                TrafficRule {
                    matcher: RuleMatch::Percentage { percent: 50 },
                    target_version: "v2".to_string(),
                },
                TrafficRule {
                    matcher: RuleMatch::Default,
                    target_version: "v1".to_string(),
                },
            ],
        ))
        .expect("Failed to create route");

    // 同一个路由键反复解析必须得到同一个版本
    let empty = HeaderMap::new();
    let first = traffic.resolve_version("user-service", &empty, "session-42");
    for _ in 0..20 {
        assert_eq!(
            traffic.resolve_version("user-service", &empty, "session-42"),
            first
        );
    }
}

#[test]
fn test_percentage_rule_splits_traffic_roughly() {
    let traffic = router();
    traffic
        .create_route(route(
            "user-service",
            vec![
                TrafficRule {
                    matcher: RuleMatch::Percentage { percent: 30 },
                    target_version: "v2".to_string(),
                },
                TrafficRule {
                    matcher: RuleMatch::Default,
                    target_version: "v1".to_string(),
                },
            ],
        ))
        .expect("Failed to create route");

    let empty = HeaderMap::new();
    let mut canary_hits = 0u32;
    for i in 0..1000 {
        let version = traffic
            .resolve_version("user-service", &empty, &format!("key-{i}"))
            .expect("Default rule should always resolve");
        if version == "v2" {
            canary_hits += 1;
        }
    }

    // 30% 上下留出哈希波动空间
    assert!(
        (200..=400).contains(&canary_hits),
        "canary hits {canary_hits} of 1000"
    );
}

#[test]
fn test_route_upsert_replaces_per_service() {
    let traffic = router();
    traffic
        .create_route(route(
            "user-service",
            vec![TrafficRule {
                matcher: RuleMatch::Default,
                target_version: "v1".to_string(),
            }],
        ))
        .expect("Failed to create route");
    traffic
        .create_route(route(
            "user-service",
            vec![TrafficRule {
                matcher: RuleMatch::Default,
                target_version: "v2".to_string(),
            }],
        ))
        .expect("Failed to create route");

    // 每个服务只保留一份规则集
    assert_eq!(traffic.list_routes().len(), 1);
    let empty = HeaderMap::new();
    assert_eq!(
        traffic.resolve_version("user-service", &empty, "k"),
        Some("v2".to_string())
    );
}

#[test]
fn test_route_validation() {
    let traffic = router();

    // 百分比超过 100
    let err = traffic
        .create_route(route(
            "user-service",
            vec![TrafficRule {
                matcher: RuleMatch::Percentage { percent: 101 },
                target_version: "v2".to_string(),
            }],
        ))
        .expect_err("Percent above 100 should be rejected");
    assert!(matches!(err, MeshError::Validation(_)));

    // 没有规则的规则集没有意义
    let err = traffic
        .create_route(route("user-service", Vec::new()))
        .expect_err("Empty rule set should be rejected");
    assert!(matches!(err, MeshError::Validation(_)));
}

#[test]
fn test_canary_splits_and_stays_sticky() {
    let traffic = router();
    let created = traffic
        .create_canary(canary("user-service", 30))
        .expect("Failed to create canary");
    assert_eq!(created.status, CanaryStatus::Running);
    assert!(!created.id.is_empty());

    let empty = HeaderMap::new();
    let mut canary_hits = 0u32;
    for i in 0..1000 {
        let version = traffic
            .resolve_version("user-service", &empty, &format!("key-{i}"))
            .expect("Running canary should always resolve");
        assert!(version == "v1" || version == "v2");
        if version == "v2" {
            canary_hits += 1;
        }
    }
    assert!(
        (200..=400).contains(&canary_hits),
        "canary hits {canary_hits} of 1000"
    );

    // 单个键固定落点
    let pinned = traffic.resolve_version("user-service", &empty, "session-7");
    for _ in 0..20 {
        assert_eq!(
            traffic.resolve_version("user-service", &empty, "session-7"),
            pinned
        );
    }
}

#[test]
fn test_promote_routes_all_traffic_to_canary() {
    let traffic = router();
    let created = traffic
        .create_canary(canary("user-service", 10))
        .expect("Failed to create canary");

    let promoted = traffic
        .promote_canary(&created.id)
        .expect("Failed to promote");
    assert_eq!(promoted.status, CanaryStatus::Promoted);
    assert_eq!(promoted.traffic_percent, 100);

    // 终态后所有键都解析到金丝雀版本
    let empty = HeaderMap::new();
    for i in 0..50 {
        assert_eq!(
            traffic.resolve_version("user-service", &empty, &format!("key-{i}")),
            Some("v2".to_string())
        );
    }
}

#[test]
fn test_rollback_restores_stable_version() {
    let traffic = router();
    let created = traffic
        .create_canary(canary("user-service", 90))
        .expect("Failed to create canary");

    let rolled = traffic
        .rollback_canary(&created.id)
        .expect("Failed to roll back");
    assert_eq!(rolled.status, CanaryStatus::RolledBack);
    assert_eq!(rolled.traffic_percent, 0);

    let empty = HeaderMap::new();
    for i in 0..50 {
        assert_eq!(
            traffic.resolve_version("user-service", &empty, &format!("key-{i}")),
            Some("v1".to_string())
        );
    }
}

#[test]
fn test_terminal_canary_ignores_further_actions() {
    let traffic = router();
    let created = traffic
        .create_canary(canary("user-service", 10))
        .expect("Failed to create canary");

    traffic
        .promote_canary(&created.id)
        .expect("Failed to promote");

    // 已到终态，回滚是幂等的空操作
    let after = traffic
        .rollback_canary(&created.id)
        .expect("Terminal rollback should not error");
    assert_eq!(after.status, CanaryStatus::Promoted);

    let err = traffic
        .promote_canary("no-such-canary")
        .expect_err("Unknown canary should be not found");
    assert!(matches!(err, MeshError::NotFound(_)));
}

#[test]
fn test_one_running_canary_per_service() {
    let traffic = router();
    traffic
        .create_canary(canary("user-service", 10))
        .expect("Failed to create first canary");

    let err = traffic
        .create_canary(canary("user-service", 20))
        .expect_err("Second running canary should be rejected");
    assert!(matches!(err, MeshError::Validation(_)));

    // 其他服务不受影响
    traffic
        .create_canary(canary("order-service", 10))
        .expect("Canary for another service should be allowed");
}

#[test]
fn test_canary_validation() {
    let traffic = router();

    let mut same_versions = canary("user-service", 10);
    same_versions.stable_version = "v2".to_string();
    assert!(matches!(
        traffic.create_canary(same_versions),
        Err(MeshError::Validation(_))
    ));

    let mut over_percent = canary("user-service", 10);
    over_percent.traffic_percent = 101;
    assert!(matches!(
        traffic.create_canary(over_percent),
        Err(MeshError::Validation(_))
    ));
}

#[test]
fn test_rules_take_precedence_over_canary() {
    let traffic = router();
    traffic
        .create_canary(canary("user-service", 0))
        .expect("Failed to create canary");
    traffic
        .create_route(route(
            "user-service",
            vec![TrafficRule {
                matcher: RuleMatch::Header {
                    name: "x-beta".to_string(),
                    value: "true".to_string(),
                },
                target_version: "v9".to_string(),
            }],
        ))
        .expect("Failed to create route");

    // 规则命中时金丝雀不参与决策
    let mut beta_headers = HeaderMap::new();
    beta_headers.insert("x-beta", "true".parse().expect("Invalid header value"));
    assert_eq!(
        traffic.resolve_version("user-service", &beta_headers, "k"),
        Some("v9".to_string())
    );

    // 规则不命中时继续走金丝雀（0% 即全部稳定版）
    let empty = HeaderMap::new();
    assert_eq!(
        traffic.resolve_version("user-service", &empty, "k"),
        Some("v1".to_string())
    );
}

#[test]
fn test_record_result_updates_running_metrics() {
    let traffic = router();
    let created = traffic
        .create_canary(canary("user-service", 50))
        .expect("Failed to create canary");

    traffic.record_result("user-service", "v2", true);
    traffic.record_result("user-service", "v2", false);
    traffic.record_result("user-service", "v1", true);

    let current = traffic
        .get_canary(&created.id)
        .expect("Canary should exist");
    assert_eq!(current.metrics.canary_requests, 2);
    assert_eq!(current.metrics.canary_errors, 1);
    assert_eq!(current.metrics.stable_requests, 1);
    assert_eq!(current.metrics.stable_errors, 0);
}

#[test]
fn test_select_instance_honors_resolved_version() {
    let registry = ServiceRegistry::new(RegistryConfig::default());
    registry
        .register(instance("user-service", "v1", 9001))
        .expect("Failed to register v1");
    let v2 = registry
        .register(instance("user-service", "v2", 9002))
        .expect("Failed to register v2");

    let traffic = TrafficRouter::new(registry);
    traffic
        .create_route(route(
            "user-service",
            vec![TrafficRule {
                matcher: RuleMatch::Default,
                target_version: "v2".to_string(),
            }],
        ))
        .expect("Failed to create route");

    let empty = HeaderMap::new();
    for _ in 0..10 {
        let selected = traffic
            .select_instance("user-service", &empty, "k")
            .expect("Expected a v2 instance");
        assert_eq!(selected.id, v2.id);
    }
}

#[test]
fn test_stats_and_reset() {
    let traffic = router();
    traffic
        .create_canary(canary("user-service", 50))
        .expect("Failed to create canary");

    let empty = HeaderMap::new();
    traffic.resolve_version("user-service", &empty, "k");
    traffic.record_result("user-service", "v2", true);

    let stats = traffic.stats();
    assert_eq!(stats.canaries, 1);
    assert_eq!(stats.running_canaries, 1);
    assert_eq!(stats.resolutions, 1);

    traffic.reset_stats();
    let stats = traffic.stats();
    assert_eq!(stats.resolutions, 0);
    // 金丝雀还在，只是观测数据归零
    assert_eq!(stats.canaries, 1);
    let current = traffic.list_canaries().pop().expect("Canary should exist");
    assert_eq!(current.metrics.canary_requests, 0);
}
