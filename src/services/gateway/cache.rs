use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::task::TaskTracker;

use super::types::UpstreamResponse;

/// 缓存条目，TTL 到期即失效
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
    stored_at: Instant,
    ttl: Duration,
}

impl CachedResponse {
    pub fn is_fresh(&self) -> bool {
        self.stored_at.elapsed() < self.ttl
    }
}

/// 网关响应缓存
///
/// 键是 "METHOD 路径?查询串"；读到过期条目时顺手移除并按未命中处理，
/// 后台清扫任务兜底回收没人再读的过期条目。
#[derive(Debug, Clone)]
pub struct ResponseCache {
    entries: Arc<DashMap<String, CachedResponse>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    task_tracker: Arc<TaskTracker>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            task_tracker: Arc::new(TaskTracker::new()),
        }
    }

    /// 启动过期条目清扫任务
    pub fn start(&self, sweep_interval: Duration) {
        let entries = self.entries.clone();

        self.task_tracker.spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                interval.tick().await;
                let before = entries.len();
                entries.retain(|_, cached| cached.is_fresh());
                let swept = before - entries.len();
                if swept > 0 {
                    tracing::debug!(swept, "Swept expired cache entries");
                }
            }
        });
    }

    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        match self.entries.get(key) {
            Some(cached) if cached.is_fresh() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(cached.clone())
            }
            Some(_) => {
                drop(self.entries.remove(key));
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: String, response: &UpstreamResponse, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        self.entries.insert(
            key,
            CachedResponse {
                status: response.status,
                content_type: response.content_type.clone(),
                body: response.body.clone(),
                stored_at: Instant::now(),
                ttl,
            },
        );
    }

    /// 丢弃某个 "METHOD 路径" 绑定下的全部条目，路由变更时调用
    pub fn invalidate_route(&self, route_key: &str) {
        let query_prefix = format!("{route_key}?");
        self.entries
            .retain(|key, _| key != route_key && !key.starts_with(&query_prefix));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ResponseCache {
    fn drop(&mut self) {
        self.task_tracker.close();
    }
}
