use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// 当前 Unix 秒
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// 服务证书
///
/// token 是不透明凭证，持有即证明身份；证书短期有效，
/// 只能重新签发，不能原地续期。时间字段都是 Unix 秒。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCertificate {
    pub service_id: String,
    pub service_name: String,
    pub token: String,
    pub issued_at: u64,
    pub expires_at: u64,
}

impl ServiceCertificate {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// 服务间访问控制条目
///
/// 没有条目即拒绝（默认关闭）；permissions 为空同样拒绝一切，
/// 放行全部权限要显式写 "*"。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclEntry {
    pub source_service: String,
    pub target_service: String,
    pub allowed: bool,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl AclEntry {
    /// 判断该条目是否放行给定权限（已小写化）
    pub fn grants(&self, permission: &str) -> bool {
        self.allowed
            && self
                .permissions
                .iter()
                .any(|p| p == "*" || p.eq_ignore_ascii_case(permission))
    }
}

/// 认证与授权统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuthStats {
    pub certificates: usize,
    pub acl_entries: usize,
    pub issued: u64,
    pub verifications: u64,
    pub denials: u64,
}
