use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::types::{AclEntry, AuthStats, ServiceCertificate, unix_now};
use crate::config::AuthConfig;
use crate::error::MeshError;

/// 服务间认证与授权
///
/// 证书按 token 建索引，ACL 按 (source, target) 建索引。
/// 授权判定是默认拒绝：没有匹配条目就是不许，这是刻意的安全不变量。
#[derive(Debug, Clone)]
pub struct AuthService {
    config: AuthConfig,
    // 证书有效期（秒），控制面可在运行时调整
    certificate_ttl_secs: Arc<AtomicU64>,
    // token -> 证书
    certificates: Arc<DashMap<String, ServiceCertificate>>,
    // "source->target" -> ACL 条目
    acls: Arc<DashMap<String, AclEntry>>,
    issued: Arc<AtomicU64>,
    verifications: Arc<AtomicU64>,
    denials: Arc<AtomicU64>,
    task_tracker: Arc<TaskTracker>,
}

fn acl_key(source: &str, target: &str) -> String {
    format!("{source}->{target}")
}

impl AuthService {
    pub fn new(config: AuthConfig) -> Self {
        let certificate_ttl_secs = Arc::new(AtomicU64::new(config.certificate_ttl_secs));
        Self {
            config,
            certificate_ttl_secs,
            certificates: Arc::new(DashMap::new()),
            acls: Arc::new(DashMap::new()),
            issued: Arc::new(AtomicU64::new(0)),
            verifications: Arc::new(AtomicU64::new(0)),
            denials: Arc::new(AtomicU64::new(0)),
            task_tracker: Arc::new(TaskTracker::new()),
        }
    }

    /// 启动过期证书清理任务
    pub fn start(&self) {
        let certificates = self.certificates.clone();
        let cleanup_interval = self.config.cleanup_interval();

        self.task_tracker.spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            loop {
                interval.tick().await;
                let now = unix_now();
                let before = certificates.len();
                certificates.retain(|_, cert| !cert.is_expired(now));
                let purged = before - certificates.len();
                if purged > 0 {
                    tracing::debug!(purged, "Purged expired service certificates");
                }
            }
        });
    }

    /// 签发证书：固定短有效期，绑定 service_id，token 为一次性随机值
    pub fn issue_certificate(
        &self,
        service_id: &str,
        service_name: &str,
    ) -> Result<ServiceCertificate, MeshError> {
        if service_id.is_empty() {
            return Err(MeshError::Validation("service_id is required".to_string()));
        }
        if service_name.is_empty() {
            return Err(MeshError::Validation(
                "service_name is required".to_string(),
            ));
        }

        let now = unix_now();
        let certificate = ServiceCertificate {
            service_id: service_id.to_string(),
            service_name: service_name.to_string(),
            token: Uuid::new_v4().to_string(),
            issued_at: now,
            expires_at: now + self.certificate_ttl_secs.load(Ordering::Relaxed),
        };

        self.certificates
            .insert(certificate.token.clone(), certificate.clone());
        self.issued.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            service_name = %service_name,
            service_id = %service_id,
            expires_at = certificate.expires_at,
            "Issued service certificate"
        );
        Ok(certificate)
    }

    /// 校验证书：未知 token 报 invalid，过期报 expired 并顺手移除
    pub fn verify_certificate(&self, token: &str) -> Result<ServiceCertificate, MeshError> {
        self.verifications.fetch_add(1, Ordering::Relaxed);

        let certificate = match self.certificates.get(token) {
            Some(cert) => cert.clone(),
            None => {
                self.denials.fetch_add(1, Ordering::Relaxed);
                return Err(MeshError::CertificateInvalid);
            }
        };

        if certificate.is_expired(unix_now()) {
            self.certificates.remove(token);
            self.denials.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                service_name = %certificate.service_name,
                "Rejected expired service certificate"
            );
            return Err(MeshError::CertificateExpired {
                service_name: certificate.service_name,
            });
        }

        Ok(certificate)
    }

    /// 插入或更新 ACL 条目，立即对后续调用生效
    pub fn upsert_acl(&self, mut entry: AclEntry) -> Result<AclEntry, MeshError> {
        if entry.source_service.is_empty() {
            return Err(MeshError::Validation(
                "source_service is required".to_string(),
            ));
        }
        if entry.target_service.is_empty() {
            return Err(MeshError::Validation(
                "target_service is required".to_string(),
            ));
        }

        // 权限统一小写比较
        for permission in &mut entry.permissions {
            *permission = permission.to_ascii_lowercase();
        }

        let key = acl_key(&entry.source_service, &entry.target_service);
        self.acls.insert(key, entry.clone());
        tracing::info!(
            source = %entry.source_service,
            target = %entry.target_service,
            allowed = entry.allowed,
            permissions = ?entry.permissions,
            "Upserted ACL entry"
        );
        Ok(entry)
    }

    /// 授权判定：没有匹配条目 = 拒绝
    pub fn authorize(&self, source_service: &str, target_service: &str, permission: &str) -> bool {
        let permission = permission.to_ascii_lowercase();
        let granted = self
            .acls
            .get(&acl_key(source_service, target_service))
            .map(|entry| entry.grants(&permission))
            .unwrap_or(false);

        if !granted {
            self.denials.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                source = %source_service,
                target = %target_service,
                permission = %permission,
                "Authorization denied"
            );
        }
        granted
    }

    pub fn list_certificates(&self) -> Vec<ServiceCertificate> {
        self.certificates.iter().map(|c| c.value().clone()).collect()
    }

    pub fn list_acls(&self) -> Vec<AclEntry> {
        self.acls.iter().map(|a| a.value().clone()).collect()
    }

    /// 立即清理过期证书，返回清掉的条数
    pub fn purge_expired(&self) -> usize {
        let now = unix_now();
        let before = self.certificates.len();
        self.certificates.retain(|_, cert| !cert.is_expired(now));
        before - self.certificates.len()
    }

    /// 授权子系统是否可用（控制面健康汇总用）
    pub fn is_operational(&self) -> bool {
        // 纯内存结构，进程在即可用
        true
    }

    pub fn certificate_ttl_secs(&self) -> u64 {
        self.certificate_ttl_secs.load(Ordering::Relaxed)
    }

    /// 调整证书有效期，只影响之后签发的证书
    pub fn set_certificate_ttl_secs(&self, ttl_secs: u64) {
        self.certificate_ttl_secs.store(ttl_secs, Ordering::Relaxed);
    }

    pub fn stats(&self) -> AuthStats {
        AuthStats {
            certificates: self.certificates.len(),
            acl_entries: self.acls.len(),
            issued: self.issued.load(Ordering::Relaxed),
            verifications: self.verifications.load(Ordering::Relaxed),
            denials: self.denials.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.issued.store(0, Ordering::Relaxed);
        self.verifications.store(0, Ordering::Relaxed);
        self.denials.store(0, Ordering::Relaxed);
    }
}

impl Drop for AuthService {
    fn drop(&mut self) {
        self.task_tracker.close();
    }
}
