//! 缓存层
//!
//! - [`store`]: 单级缓存存储与两级组合
//! - [`record_cache`]: 规则记录缓存（两级 + 存储兜底）
//! - [`artifact_cache`]: 按业务标识缓存构建产物，每个键同时至多一次构建
//! - [`adhoc_cache`]: 按内容指纹缓存临时规则的构建产物，带 TTL 和容量淘汰

pub mod adhoc_cache;
pub mod artifact_cache;
pub mod record_cache;
pub mod store;

pub use adhoc_cache::{AdhocCache, AdhocStats};
pub use artifact_cache::{ArtifactCache, ArtifactCacheStats};
pub use record_cache::RuleRecordCache;
pub use store::{CacheStore, MemoryCacheStore, RedisCacheStore, TieredCache};

use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::{Mutex, MutexGuard};

/// 分片构建锁
///
/// 同一个键总是落在同一个分片上，因此同一个键的构建互斥；
/// 不同分片上的键可以并行构建。
pub(crate) struct BuildLocks {
    shards: Vec<Mutex<()>>,
}

impl BuildLocks {
    pub(crate) fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    pub(crate) async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        self.shards[index].lock().await
    }
}

/// 命中率，无请求时为 0
pub(crate) fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// 对外统计信息
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// 临时规则缓存条目数
    pub entries: usize,
    /// 临时规则缓存命中率
    pub hit_rate: f64,
    /// 临时规则缓存容量
    pub capacity: usize,
    /// 业务产物缓存
    pub artifacts: ArtifactCacheStats,
}
