use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

use super::cache::ResponseCache;
use super::types::{
    Aggregation, GatewayRequest, GatewayResponse, GatewayStats, Route, Transformation,
    UpstreamResponse,
};
use crate::config::GatewayConfig;
use crate::error::MeshError;
use crate::services::auth::AuthService;
use crate::services::breaker::CircuitBreakerService;
use crate::services::registry::{ServiceInstance, ServiceRegistry};
use crate::services::retry::RetryService;
use crate::services::traffic::TrafficRouter;

// 亲和路由键与服务身份凭证的请求头
const ROUTING_KEY_HEADER: &str = "x-routing-key";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
const SERVICE_TOKEN_HEADER: &str = "x-service-token";

/// API 网关
///
/// 一次请求的处理顺序：路由解析 -> 缓存 -> 鉴权 -> 版本决策 ->
/// 实例选取 -> 熔断 + 重试下的转发 -> 回填缓存。
/// 实例选取放在重试闭包里，每次尝试都可能落到不同的健康实例上。
#[derive(Debug, Clone)]
pub struct ApiGateway {
    config: GatewayConfig,
    registry: ServiceRegistry,
    breaker: CircuitBreakerService,
    retry: RetryService,
    auth: AuthService,
    traffic: TrafficRouter,
    // "METHOD path" -> 路由
    routes: Arc<DashMap<String, Route>>,
    cache: ResponseCache,
    http_client: reqwest::Client,
    // 默认转发超时，控制面可在运行时调整
    dispatch_timeout_ms: Arc<AtomicU64>,
    requests: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
    auth_rejections: Arc<AtomicU64>,
}

fn route_key(method: &str, path: &str) -> String {
    format!("{method} {path}")
}

fn cache_key(request: &GatewayRequest) -> String {
    match &request.query {
        Some(query) => format!("{} {}?{}", request.method, request.path, query),
        None => format!("{} {}", request.method, request.path),
    }
}

impl ApiGateway {
    pub fn new(
        config: GatewayConfig,
        registry: ServiceRegistry,
        breaker: CircuitBreakerService,
        retry: RetryService,
        auth: AuthService,
        traffic: TrafficRouter,
    ) -> Self {
        let http_client = reqwest::Client::builder().build().unwrap_or_default();
        let dispatch_timeout_ms = Arc::new(AtomicU64::new(config.dispatch_timeout_ms));

        Self {
            config,
            registry,
            breaker,
            retry,
            auth,
            traffic,
            routes: Arc::new(DashMap::new()),
            cache: ResponseCache::new(),
            http_client,
            dispatch_timeout_ms,
            requests: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
            auth_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 启动缓存清扫任务
    pub fn start(&self) {
        self.cache.start(self.config.cache_sweep_interval());
    }

    /// 注册路由；相同 (method, path) 重复注册会替换旧路由
    pub fn register_route(&self, mut route: Route) -> Result<Route, MeshError> {
        if !route.path.starts_with('/') {
            return Err(MeshError::Validation(
                "path must start with '/'".to_string(),
            ));
        }
        route.method = route.method.to_ascii_uppercase();
        if http::Method::from_bytes(route.method.as_bytes()).is_err() {
            return Err(MeshError::Validation(format!(
                "unknown HTTP method '{}'",
                route.method
            )));
        }
        if route.service_name.is_empty() {
            return Err(MeshError::Validation(
                "service_name is required".to_string(),
            ));
        }
        if let Some(aggregation) = &route.aggregation {
            if aggregation.targets.is_empty() {
                return Err(MeshError::Validation(
                    "aggregation needs at least one target".to_string(),
                ));
            }
            for target in &aggregation.targets {
                if target.key.is_empty() || target.service_name.is_empty() {
                    return Err(MeshError::Validation(
                        "aggregation targets need key and service_name".to_string(),
                    ));
                }
            }
        }

        if route.id.is_empty() {
            route.id = Uuid::new_v4().to_string();
        }

        let key = route_key(&route.method, &route.path);
        // 旧绑定的缓存条目随路由定义一起作废
        self.cache.invalidate_route(&key);
        self.routes.insert(key, route.clone());
        tracing::info!(
            route_id = %route.id,
            method = %route.method,
            path = %route.path,
            service_name = %route.service_name,
            requires_auth = route.requires_auth,
            "Registered gateway route"
        );
        Ok(route)
    }

    pub fn list_routes(&self) -> Vec<Route> {
        self.routes.iter().map(|r| r.value().clone()).collect()
    }

    pub fn remove_route(&self, route_id: &str) -> bool {
        let key = self
            .routes
            .iter()
            .find(|r| r.value().id == route_id)
            .map(|r| r.key().clone());
        match key {
            Some(key) => {
                self.routes.remove(&key);
                self.cache.invalidate_route(&key);
                tracing::info!(route_id = %route_id, "Removed gateway route");
                true
            }
            None => false,
        }
    }

    /// 处理一次入站请求
    pub async fn handle(&self, request: GatewayRequest) -> Result<GatewayResponse, MeshError> {
        self.requests.fetch_add(1, Ordering::Relaxed);

        let key = route_key(request.method.as_str(), &request.path);
        let route = match self.routes.get(&key) {
            Some(route) => route.clone(),
            None => {
                return Err(MeshError::NotFound(format!(
                    "no route for {} {}",
                    request.method, request.path
                )));
            }
        };

        // 只有 GET 路由参与缓存
        let cacheable = route.cache_ttl_secs.is_some() && request.method == http::Method::GET;
        let cache_key = cache_key(&request);
        if cacheable {
            if let Some(cached) = self.cache.get(&cache_key) {
                tracing::debug!(method = %request.method, path = %request.path, "Serving cached response");
                return Ok(GatewayResponse {
                    status: cached.status,
                    content_type: cached.content_type,
                    cache_state: Some("hit"),
                    body: cached.body,
                });
            }
        }

        if route.requires_auth {
            if let Err(e) = self.enforce_auth(&request, &route) {
                self.auth_rejections.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    method = %request.method,
                    path = %request.path,
                    error = %e,
                    "Rejected request at auth check"
                );
                return Err(e);
            }
        }

        // 亲和键优先取显式路由键，退一步用调用方 IP，都没有就不保证亲和
        let routing_key = request
            .headers
            .get(ROUTING_KEY_HEADER)
            .or_else(|| request.headers.get(FORWARDED_FOR_HEADER))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let timeout = route
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.dispatch_timeout());

        let upstream = if let Some(aggregation) = &route.aggregation {
            self.handle_aggregation(aggregation, &request, &routing_key, timeout)
                .await?
        } else {
            let target_path = route.target_path.as_deref().unwrap_or(&route.path);
            match self
                .dispatch_resilient(
                    &route.service_name,
                    request.method.clone(),
                    target_path,
                    request.query.as_deref(),
                    &request.headers,
                    request.body.clone(),
                    &routing_key,
                    timeout,
                )
                .await
            {
                Ok(upstream) => upstream,
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        };

        let shaped = match &route.transformation {
            Some(transformation) => apply_transformation(transformation, upstream),
            None => upstream,
        };

        // 只回填 2xx，重定向和错误响应不进缓存
        let cache_state = if cacheable && (200..300).contains(&shaped.status) {
            let ttl = Duration::from_secs(route.cache_ttl_secs.unwrap_or(0));
            self.cache.put(cache_key, &shaped, ttl);
            Some("miss")
        } else {
            None
        };

        Ok(GatewayResponse {
            status: shaped.status,
            content_type: shaped.content_type,
            cache_state,
            body: shaped.body,
        })
    }

    // 证书校验 + ACL 判定，权限名取小写的 HTTP 方法
    fn enforce_auth(&self, request: &GatewayRequest, route: &Route) -> Result<(), MeshError> {
        let token = request
            .headers
            .get(SERVICE_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(MeshError::CertificateInvalid)?;
        let certificate = self.auth.verify_certificate(token)?;

        let permission = request.method.as_str().to_ascii_lowercase();
        if !self
            .auth
            .authorize(&certificate.service_name, &route.service_name, &permission)
        {
            return Err(MeshError::AccessDenied {
                source_service: certificate.service_name,
                target_service: route.service_name.clone(),
                permission,
            });
        }
        Ok(())
    }

    /// 在熔断器与重试策略保护下转发到后端
    ///
    /// 闭包每次尝试都重新做版本决策和实例选取；结果按实例的实际版本
    /// 记入金丝雀观测。
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_resilient(
        &self,
        service_name: &str,
        method: http::Method,
        path: &str,
        query: Option<&str>,
        headers: &http::HeaderMap,
        body: Bytes,
        routing_key: &str,
        timeout: Duration,
    ) -> Result<UpstreamResponse, MeshError> {
        let method = &method;
        let body = &body;
        self.retry
            .execute(service_name, &self.breaker, || async move {
                let version = self
                    .traffic
                    .resolve_version(service_name, headers, routing_key);
                let instance = self
                    .registry
                    .select_version_instance(
                        service_name,
                        version.as_deref(),
                        self.registry.default_strategy(),
                    )
                    .ok_or_else(|| MeshError::Unavailable {
                        service_name: service_name.to_string(),
                    })?;

                // 守卫保证超时或取消的尝试也会释放 in-flight 名额
                let inflight = self.registry.track_inflight(&instance.id);
                let result = self
                    .send_upstream(&instance, method.clone(), path, query, headers, body.clone(), timeout)
                    .await;
                drop(inflight);

                self.traffic
                    .record_result(service_name, &instance.version, result.is_ok());
                result
            })
            .await
    }

    async fn send_upstream(
        &self,
        instance: &ServiceInstance,
        method: http::Method,
        path: &str,
        query: Option<&str>,
        headers: &http::HeaderMap,
        body: Bytes,
        timeout: Duration,
    ) -> Result<UpstreamResponse, MeshError> {
        let mut url = format!("{}{}", instance.base_url(), path);
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }

        // host 和长度头由客户端按新连接重建
        let mut forward_headers = headers.clone();
        forward_headers.remove(http::header::HOST);
        forward_headers.remove(http::header::CONTENT_LENGTH);

        let mut request = self
            .http_client
            .request(method, &url)
            .timeout(timeout)
            .headers(forward_headers);
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                tracing::debug!(url = %url, "Upstream call timed out");
                return Err(MeshError::GatewayTimeout { timeout });
            }
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Upstream call failed");
                return Err(MeshError::Network(e.to_string()));
            }
        };

        let status = response.status().as_u16();
        // 5xx 视为失败参与重试与熔断，4xx 是后端的正常回答，原样透传
        if status >= 500 {
            return Err(MeshError::Upstream { status });
        }

        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| MeshError::Network(e.to_string()))?;

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }

    // 并发调用所有分支，失败的分支以 {"error": ...} 占位，不拖垮整次聚合
    async fn handle_aggregation(
        &self,
        aggregation: &Aggregation,
        request: &GatewayRequest,
        routing_key: &str,
        timeout: Duration,
    ) -> Result<UpstreamResponse, MeshError> {
        let branches = aggregation.targets.iter().map(|target| {
            let headers = &request.headers;
            async move {
                let result = self
                    .dispatch_resilient(
                        &target.service_name,
                        http::Method::GET,
                        &target.path,
                        None,
                        headers,
                        Bytes::new(),
                        routing_key,
                        timeout,
                    )
                    .await;
                (target.key.clone(), result)
            }
        });

        let mut merged = serde_json::Map::new();
        for (key, result) in join_all(branches).await {
            let value = match result {
                Ok(response) => serde_json::from_slice(&response.body).unwrap_or_else(|_| {
                    Value::String(String::from_utf8_lossy(&response.body).into_owned())
                }),
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(branch = %key, error = %e, "Aggregation branch failed");
                    json!({ "error": e.to_string() })
                }
            };
            merged.insert(key, value);
        }

        let body = serde_json::to_vec(&Value::Object(merged))
            .map_err(|e| MeshError::Internal(e.to_string()))?;
        Ok(UpstreamResponse {
            status: 200,
            content_type: Some("application/json".to_string()),
            body: body.into(),
        })
    }

    pub fn max_body_bytes(&self) -> usize {
        self.config.max_body_bytes
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn dispatch_timeout_ms(&self) -> u64 {
        self.dispatch_timeout_ms.load(Ordering::Relaxed)
    }

    /// 调整默认转发超时，只影响之后的请求
    pub fn set_dispatch_timeout_ms(&self, timeout_ms: u64) {
        self.dispatch_timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            routes: self.routes.len(),
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            auth_rejections: self.auth_rejections.load(Ordering::Relaxed),
            inflight: self.registry.total_inflight(),
            cache_entries: self.cache.len(),
            cache_hits: self.cache.hits(),
            cache_misses: self.cache.misses(),
        }
    }

    /// 清零计数器并丢弃缓存内容，路由定义保留
    pub fn reset_stats(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.auth_rejections.store(0, Ordering::Relaxed);
        self.cache.reset_stats();
        self.cache.clear();
    }
}

/// 响应重塑；非 JSON 响应体不做任何处理
fn apply_transformation(
    transformation: &Transformation,
    response: UpstreamResponse,
) -> UpstreamResponse {
    let Ok(value) = serde_json::from_slice::<Value>(&response.body) else {
        return response;
    };

    let transformed = match transformation {
        Transformation::PickFields { fields } => match value {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .filter(|(key, _)| fields.contains(key))
                    .collect(),
            ),
            other => other,
        },
        Transformation::OmitFields { fields } => match value {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .filter(|(key, _)| !fields.contains(key))
                    .collect(),
            ),
            other => other,
        },
        Transformation::Envelope { key } => {
            let mut wrapped = serde_json::Map::new();
            wrapped.insert(key.clone(), value);
            Value::Object(wrapped)
        }
    };

    match serde_json::to_vec(&transformed) {
        Ok(body) => UpstreamResponse {
            status: response.status,
            content_type: Some("application/json".to_string()),
            body: body.into(),
        },
        Err(_) => response,
    }
}
