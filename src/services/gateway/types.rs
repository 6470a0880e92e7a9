use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// 聚合路由的一个分支
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationTarget {
    /// 合并结果里的字段名
    pub key: String,
    pub service_name: String,
    pub path: String,
}

/// 扇出聚合配置：并发调用所有分支，按 key 合并成一个 JSON 对象
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregation {
    pub targets: Vec<AggregationTarget>,
}

/// 响应重塑，只作用于 JSON 响应体，其他内容原样透传
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transformation {
    /// 只保留列出的顶层字段
    PickFields { fields: Vec<String> },
    /// 去掉列出的顶层字段
    OmitFields { fields: Vec<String> },
    /// 包一层信封 {key: body}
    Envelope { key: String },
}

/// 网关路由：(method, path) 精确匹配到一个后端服务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub id: String,
    pub path: String,
    pub method: String,
    pub service_name: String,
    /// 后端路径，缺省与对外路径一致
    #[serde(default)]
    pub target_path: Option<String>,
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
    /// 单次尝试的超时，缺省取网关全局配置
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub requires_auth: bool,
    #[serde(default)]
    pub aggregation: Option<Aggregation>,
    #[serde(default)]
    pub transformation: Option<Transformation>,
}

/// 进入网关的一次请求
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: http::Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

/// 后端返回的原始响应
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// 网关对外的最终响应
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub content_type: Option<String>,
    /// x-cache 响应头的取值：hit / miss，不可缓存时为 None
    pub cache_state: Option<&'static str>,
    pub body: Bytes,
}

/// 网关统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct GatewayStats {
    pub routes: usize,
    pub requests: u64,
    pub failures: u64,
    pub auth_rejections: u64,
    /// 当前还在途的上游调用数
    pub inflight: i64,
    pub cache_entries: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
}
