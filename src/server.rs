use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::response::{IntoResponse, Response};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::MeshConfig;
use crate::services::ControlPlane;
use crate::services::control::{ApiError, admin_router};
use crate::services::gateway::GatewayRequest;

/// 启动 HTTP 服务：/mesh 下是管理面，其余路径全部交给网关转发
pub async fn start(config: MeshConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = config.server.listen_addr.clone();

    // 初始化控制面并启动各组件的后台任务
    let control = ControlPlane::new(&config);
    control.start();

    let app = build_router(control);

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Mesh gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Mesh gateway stopped");
    Ok(())
}

/// 组装路由：管理面 + 数据面兜底转发
pub fn build_router(control: ControlPlane) -> Router {
    let body_limit = control.gateway().max_body_bytes();

    admin_router()
        .fallback(forward_to_gateway)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(control)
}

/// 数据面入口：把原始 HTTP 请求交给网关处理后按原样回写
async fn forward_to_gateway(
    State(control): State<ControlPlane>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = GatewayRequest {
        method,
        path: uri.path().to_string(),
        query: uri.query().map(|q| q.to_string()),
        headers,
        body,
    };

    match control.gateway().handle(request).await {
        Ok(response) => {
            let status =
                StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut header_map = HeaderMap::new();
            if let Some(content_type) = &response.content_type {
                if let Ok(value) = HeaderValue::from_str(content_type) {
                    header_map.insert(http::header::CONTENT_TYPE, value);
                }
            }
            if let Some(cache_state) = response.cache_state {
                header_map.insert("x-cache", HeaderValue::from_static(cache_state));
            }
            (status, header_map, response.body).into_response()
        }
        Err(e) => ApiError(e).into_response(),
    }
}

/// 等待 Ctrl+C 或 SIGTERM，触发优雅退出
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl+C received, shutting down"),
        _ = terminate => tracing::info!("SIGTERM received, shutting down"),
    }
}
