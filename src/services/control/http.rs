use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::service::ControlPlane;
use super::types::{MeshHealth, MeshSettings, MeshStats, SettingsUpdate};
use crate::error::MeshError;
use crate::services::auth::{AclEntry, ServiceCertificate};
use crate::services::breaker::BreakerSnapshot;
use crate::services::gateway::Route;
use crate::services::registry::ServiceInstance;
use crate::services::retry::RetryPolicy;
use crate::services::traffic::{CanaryDeployment, TrafficRoute};

/// 统一响应信封：{success, data?, error?, message?}
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data: Some(data),
        error: None,
        message: None,
    })
}

fn ok_message<T: Serialize>(data: T, message: &str) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data: Some(data),
        error: None,
        message: Some(message.to_string()),
    })
}

/// 网格错误到 HTTP 响应的包装
///
/// 状态码和分类名按统一错误分类映射，原始细节只进服务端日志。
#[derive(Debug)]
pub struct ApiError(pub MeshError);

impl From<MeshError> for ApiError {
    fn from(e: MeshError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self.0, kind = self.0.kind(), "Admin API request failed");
        }

        let envelope = Envelope::<serde_json::Value> {
            success: false,
            data: None,
            error: Some(self.0.kind().to_string()),
            message: Some(self.0.to_string()),
        };
        let mut response = (status, Json(envelope)).into_response();
        if let Some(secs) = self.0.retry_after_hint() {
            response
                .headers_mut()
                .insert(http::header::RETRY_AFTER, http::HeaderValue::from(secs));
        }
        response
    }
}

/// 管理 API 路由表，挂在 /mesh 前缀下
pub fn admin_router() -> Router<ControlPlane> {
    Router::new().nest(
        "/mesh",
        Router::new()
            .route("/status", get(mesh_status))
            .route("/config", get(get_config).put(put_config))
            .route("/stats", get(get_stats))
            .route("/stats/reset", post(reset_stats))
            .route("/services", get(list_services).post(register_service))
            .route(
                "/services/{service_name}/{instance_id}",
                axum::routing::delete(deregister_service),
            )
            .route(
                "/services/{service_name}/{instance_id}/health",
                post(set_instance_health),
            )
            .route(
                "/retry-policies",
                get(list_retry_policies).post(register_retry_policy),
            )
            .route("/routes", get(list_routes).post(register_route))
            .route("/routes/{route_id}", axum::routing::delete(remove_route))
            .route(
                "/traffic-rules",
                get(list_traffic_rules).post(create_traffic_rule),
            )
            .route(
                "/traffic-rules/{route_id}",
                axum::routing::delete(remove_traffic_rule),
            )
            .route("/canaries", get(list_canaries).post(create_canary))
            .route("/canaries/{id}/promote", post(promote_canary))
            .route("/canaries/{id}/rollback", post(rollback_canary))
            .route(
                "/certificates",
                get(list_certificates).post(issue_certificate),
            )
            .route("/acls", get(list_acls).post(upsert_acl))
            .route("/breakers", get(list_breakers))
            .route("/breakers/{name}/reset", post(reset_breaker)),
    )
}

async fn mesh_status(State(control): State<ControlPlane>) -> Json<Envelope<MeshHealth>> {
    ok(control.health())
}

async fn get_config(State(control): State<ControlPlane>) -> Json<Envelope<MeshSettings>> {
    ok(control.settings())
}

async fn put_config(
    State(control): State<ControlPlane>,
    Json(update): Json<SettingsUpdate>,
) -> Json<Envelope<MeshSettings>> {
    ok_message(control.update_settings(update), "configuration updated")
}

async fn get_stats(State(control): State<ControlPlane>) -> Json<Envelope<MeshStats>> {
    ok(control.stats())
}

async fn reset_stats(State(control): State<ControlPlane>) -> Json<Envelope<serde_json::Value>> {
    control.reset_all_stats();
    ok_message(serde_json::Value::Null, "statistics reset")
}

async fn list_services(
    State(control): State<ControlPlane>,
) -> Json<Envelope<Vec<ServiceInstance>>> {
    ok(control.registry().all_instances())
}

async fn register_service(
    State(control): State<ControlPlane>,
    Json(instance): Json<ServiceInstance>,
) -> Result<Json<Envelope<ServiceInstance>>, ApiError> {
    let registered = control.registry().register(instance)?;
    Ok(ok(registered))
}

async fn deregister_service(
    State(control): State<ControlPlane>,
    Path((service_name, instance_id)): Path<(String, String)>,
) -> Result<Json<Envelope<serde_json::Value>>, ApiError> {
    if control.registry().deregister(&service_name, &instance_id) {
        Ok(ok_message(serde_json::Value::Null, "instance deregistered"))
    } else {
        Err(ApiError(MeshError::NotFound(format!(
            "instance '{instance_id}' of service '{service_name}' not found"
        ))))
    }
}

#[derive(Debug, Deserialize)]
struct HealthOverride {
    healthy: bool,
}

async fn set_instance_health(
    State(control): State<ControlPlane>,
    Path((service_name, instance_id)): Path<(String, String)>,
    Json(body): Json<HealthOverride>,
) -> Result<Json<Envelope<serde_json::Value>>, ApiError> {
    if control
        .registry()
        .set_health(&service_name, &instance_id, body.healthy)
    {
        Ok(ok_message(serde_json::Value::Null, "instance health updated"))
    } else {
        Err(ApiError(MeshError::NotFound(format!(
            "instance '{instance_id}' of service '{service_name}' not found"
        ))))
    }
}

async fn list_retry_policies(
    State(control): State<ControlPlane>,
) -> Json<Envelope<Vec<RetryPolicy>>> {
    ok(control.retry().list_policies())
}

async fn register_retry_policy(
    State(control): State<ControlPlane>,
    Json(policy): Json<RetryPolicy>,
) -> Result<Json<Envelope<RetryPolicy>>, ApiError> {
    let registered = control.retry().register_policy(policy)?;
    Ok(ok(registered))
}

async fn list_routes(State(control): State<ControlPlane>) -> Json<Envelope<Vec<Route>>> {
    ok(control.gateway().list_routes())
}

async fn register_route(
    State(control): State<ControlPlane>,
    Json(route): Json<Route>,
) -> Result<Json<Envelope<Route>>, ApiError> {
    let registered = control.gateway().register_route(route)?;
    Ok(ok(registered))
}

async fn remove_route(
    State(control): State<ControlPlane>,
    Path(route_id): Path<String>,
) -> Result<Json<Envelope<serde_json::Value>>, ApiError> {
    if control.gateway().remove_route(&route_id) {
        Ok(ok_message(serde_json::Value::Null, "route removed"))
    } else {
        Err(ApiError(MeshError::NotFound(format!(
            "route '{route_id}' not found"
        ))))
    }
}

async fn list_traffic_rules(
    State(control): State<ControlPlane>,
) -> Json<Envelope<Vec<TrafficRoute>>> {
    ok(control.traffic().list_routes())
}

async fn create_traffic_rule(
    State(control): State<ControlPlane>,
    Json(route): Json<TrafficRoute>,
) -> Result<Json<Envelope<TrafficRoute>>, ApiError> {
    let created = control.traffic().create_route(route)?;
    Ok(ok(created))
}

async fn remove_traffic_rule(
    State(control): State<ControlPlane>,
    Path(route_id): Path<String>,
) -> Result<Json<Envelope<serde_json::Value>>, ApiError> {
    if control.traffic().remove_route(&route_id) {
        Ok(ok_message(serde_json::Value::Null, "traffic route removed"))
    } else {
        Err(ApiError(MeshError::NotFound(format!(
            "traffic route '{route_id}' not found"
        ))))
    }
}

async fn list_canaries(
    State(control): State<ControlPlane>,
) -> Json<Envelope<Vec<CanaryDeployment>>> {
    ok(control.traffic().list_canaries())
}

async fn create_canary(
    State(control): State<ControlPlane>,
    Json(deployment): Json<CanaryDeployment>,
) -> Result<Json<Envelope<CanaryDeployment>>, ApiError> {
    let created = control.traffic().create_canary(deployment)?;
    Ok(ok(created))
}

async fn promote_canary(
    State(control): State<ControlPlane>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<CanaryDeployment>>, ApiError> {
    let deployment = control.traffic().promote_canary(&id)?;
    Ok(ok(deployment))
}

async fn rollback_canary(
    State(control): State<ControlPlane>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<CanaryDeployment>>, ApiError> {
    let deployment = control.traffic().rollback_canary(&id)?;
    Ok(ok(deployment))
}

#[derive(Debug, Deserialize)]
struct CertificateRequest {
    service_id: String,
    service_name: String,
}

async fn list_certificates(
    State(control): State<ControlPlane>,
) -> Json<Envelope<Vec<ServiceCertificate>>> {
    ok(control.auth().list_certificates())
}

async fn issue_certificate(
    State(control): State<ControlPlane>,
    Json(request): Json<CertificateRequest>,
) -> Result<Json<Envelope<ServiceCertificate>>, ApiError> {
    let certificate = control
        .auth()
        .issue_certificate(&request.service_id, &request.service_name)?;
    Ok(ok(certificate))
}

async fn list_acls(State(control): State<ControlPlane>) -> Json<Envelope<Vec<AclEntry>>> {
    ok(control.auth().list_acls())
}

async fn upsert_acl(
    State(control): State<ControlPlane>,
    Json(entry): Json<AclEntry>,
) -> Result<Json<Envelope<AclEntry>>, ApiError> {
    let stored = control.auth().upsert_acl(entry)?;
    Ok(ok(stored))
}

async fn list_breakers(
    State(control): State<ControlPlane>,
) -> Json<Envelope<Vec<BreakerSnapshot>>> {
    ok(control.breaker().snapshots())
}

async fn reset_breaker(
    State(control): State<ControlPlane>,
    Path(name): Path<String>,
) -> Result<Json<Envelope<serde_json::Value>>, ApiError> {
    if control.breaker().reset(&name) {
        Ok(ok_message(serde_json::Value::Null, "circuit breaker reset"))
    } else {
        Err(ApiError(MeshError::NotFound(format!(
            "circuit breaker '{name}' not found"
        ))))
    }
}
