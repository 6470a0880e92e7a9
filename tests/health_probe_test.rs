use std::collections::HashMap;
use std::time::SystemTime;

use axum::Router;
use axum::routing::get;
use http::StatusCode;

use mesh_gateway::config::RegistryConfig;
use mesh_gateway::services::registry::{HealthProber, ServiceInstance, ServiceRegistry};

async fn spawn_health_endpoint(status: StatusCode) -> u16 {
    let app = Router::new().route("/health", get(move || async move { status }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind listener");
    let port = listener.local_addr().expect("Missing local addr").port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Upstream failed");
    });
    port
}

/// 申请一个端口再立刻释放，得到一个必然拒绝连接的端口
async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind listener");
    listener.local_addr().expect("Missing local addr").port()
}

fn instance(service_name: &str, port: u16) -> ServiceInstance {
    ServiceInstance {
        id: String::new(),
        service_name: service_name.to_string(),
        version: "v1".to_string(),
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

fn config() -> RegistryConfig {
    RegistryConfig {
        unhealthy_after: 2,
        probe_timeout_secs: 1,
        ..RegistryConfig::default()
    }
}

#[tokio::test]
async fn test_probe_marks_dead_instance_unhealthy() {
    let live_port = spawn_health_endpoint(StatusCode::OK).await;
    let dead_port = closed_port().await;

    let registry = ServiceRegistry::new(config());
    let live = registry
        .register(instance("user-service", live_port))
        .expect("Failed to register live instance");
    let dead = registry
        .register(instance("user-service", dead_port))
        .expect("Failed to register dead instance");

    let prober = HealthProber::new(config(), registry.clone());

    // 阈值是连续两次失败，第一轮还不剔除
    prober.probe_all().await;
    let healthy_after_one: Vec<bool> = registry
        .instances_of("user-service")
        .iter()
        .map(|i| i.healthy)
        .collect();
    assert_eq!(healthy_after_one, vec![true, true]);

    prober.probe_all().await;
    let by_id: HashMap<String, bool> = registry
        .instances_of("user-service")
        .into_iter()
        .map(|i| (i.id, i.healthy))
        .collect();
    assert_eq!(by_id.get(&live.id), Some(&true));
    assert_eq!(by_id.get(&dead.id), Some(&false));
}

#[tokio::test]
async fn test_probe_recovers_unhealthy_instance_immediately() {
    let live_port = spawn_health_endpoint(StatusCode::OK).await;

    let registry = ServiceRegistry::new(config());
    let registered = registry
        .register(instance("user-service", live_port))
        .expect("Failed to register instance");
    registry.set_health("user-service", &registered.id, false);

    // 单次探测成功立即恢复
    let prober = HealthProber::new(config(), registry.clone());
    prober.probe_all().await;

    assert!(registry.instances_of("user-service")[0].healthy);
}

#[tokio::test]
async fn test_probe_treats_error_status_as_failure() {
    let failing_port = spawn_health_endpoint(StatusCode::INTERNAL_SERVER_ERROR).await;

    let registry = ServiceRegistry::new(config());
    registry
        .register(instance("user-service", failing_port))
        .expect("Failed to register instance");

    let prober = HealthProber::new(config(), registry.clone());
    prober.probe_all().await;
    prober.probe_all().await;

    // 探测端点 5xx 与连不上同样计失败
    assert!(!registry.instances_of("user-service")[0].healthy);
}
