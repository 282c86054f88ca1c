//! 缓存层存储
//!
//! 两级规则记录缓存的每一级都实现 [`CacheStore`]：主缓存为 Redis，
//! 次级缓存为进程内 `DashMap`。[`TieredCache`] 把两级组合起来。

use async_trait::async_trait;
use dashmap::DashMap;
use decision_shared::cache::Cache;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Result, RuleError};

/// 单级缓存存储，按字节读写
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// 用于日志和指标的名字
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// TTL 为零表示不过期
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// 释放底层资源；连接按次获取的实现无需处理
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Redis 主缓存
#[derive(Clone)]
pub struct RedisCacheStore {
    cache: Cache,
}

impl RedisCacheStore {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.cache.get_bytes(key).await?)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        Ok(self.cache.set_bytes(key, value, ttl).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        Ok(self.cache.delete(key).await?)
    }
}

struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }
}

/// 进程内次级缓存
///
/// 过期条目在读取时惰性清除，[`MemoryCacheStore::purge_expired`] 可批量清理。
#[derive(Clone, Default)]
pub struct MemoryCacheStore {
    entries: Arc<DashMap<String, MemoryEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 清除所有过期条目，返回清除数量
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "已清理过期的本地缓存条目");
        }
        removed
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }
        // 读锁已释放，再删除过期条目
        self.entries.remove_if(key, |_, entry| entry.is_expired());
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

/// 两级缓存
///
/// - 读：优先主缓存；主缓存出错才读次级缓存。主缓存未命中直接返回未命中，
///   次级缓存命中也不回填主缓存。"主缓存未命中或出错时改读次级"与"仅在主缓存
///   故障时读次级"两种读法中取后者：两级同步写入，主缓存未命中即视为两级都未命中。
/// - 写：两级都写，任一成功即成功，只有两级都失败才返回错误。
pub struct TieredCache {
    primary: Arc<dyn CacheStore>,
    secondary: Arc<dyn CacheStore>,
}

impl TieredCache {
    pub fn new(primary: Arc<dyn CacheStore>, secondary: Arc<dyn CacheStore>) -> Self {
        Self { primary, secondary }
    }

    /// 读取；两级都失败时返回最后一个错误
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.primary.get(key).await {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(
                    tier = self.primary.name(),
                    key = %key,
                    error = %e,
                    "主缓存读取失败，改读次级缓存"
                );
                decision_shared::observability::metrics::record_cache_fallback("primary");
                self.secondary.get(key).await
            }
        }
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let (primary, secondary) = tokio::join!(
            self.primary.set(key, value, ttl),
            self.secondary.set(key, value, ttl)
        );

        match (primary, secondary) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => {
                warn!(key = %key, error = %e, "单级缓存写入失败");
                Ok(())
            }
            (Err(p), Err(s)) => Err(RuleError::CacheIoError(format!(
                "两级缓存写入均失败: {}={}; {}={}",
                self.primary.name(),
                p,
                self.secondary.name(),
                s
            ))),
        }
    }

    /// 两级都删除，任一成功即成功
    pub async fn delete(&self, key: &str) -> Result<()> {
        let (primary, secondary) =
            tokio::join!(self.primary.delete(key), self.secondary.delete(key));
        match (primary, secondary) {
            (Err(p), Err(s)) => Err(RuleError::CacheIoError(format!(
                "两级缓存删除均失败: {}; {}",
                p, s
            ))),
            _ => Ok(()),
        }
    }

    /// 关闭两级缓存，两级都失败才返回错误
    pub async fn close(&self) -> Result<()> {
        let (primary, secondary) = tokio::join!(self.primary.close(), self.secondary.close());
        match (primary, secondary) {
            (Err(p), Err(s)) => Err(RuleError::CacheIoError(format!(
                "两级缓存关闭均失败: {}; {}",
                p, s
            ))),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => {
                warn!(error = %e, "单级缓存关闭失败");
                Ok(())
            }
            (Ok(()), Ok(())) => Ok(()),
        }
    }
}
