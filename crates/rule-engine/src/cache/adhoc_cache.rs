//! 临时规则缓存
//!
//! 调用方直接提供规则定义（不经过存储），按内容指纹缓存构建产物。
//! 结构相同的定义无论在哪里构造都共享同一个产物。
//!
//! - 过期：命中时检查 `now - created_at > ttl`，过期则异步删除并按未命中处理
//! - 容量：插入前达到容量时，按命中次数升序、创建时间升序淘汰约 10%（至少 1 个）

use dashmap::DashMap;
use decision_shared::observability::metrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::artifact_cache::definition_form;
use super::{BuildLocks, hit_rate};
use crate::compiler::RuleCompiler;
use crate::context::RequestContext;
use crate::engine::{CompiledArtifact, RuleEngine};
use crate::error::{Result, RuleError};
use crate::models::RuleDefinition;

/// 临时规则缓存统计
#[derive(Debug, Clone, Serialize)]
pub struct AdhocStats {
    pub entries: usize,
    pub hit_rate: f64,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

struct AdhocEntry<A> {
    artifact: Arc<CompiledArtifact<A>>,
    created_at: Instant,
    hits: AtomicU64,
}

struct Inner<E: RuleEngine> {
    engine: Arc<E>,
    compiler: RuleCompiler,
    entries: DashMap<String, Arc<AdhocEntry<E::Artifact>>>,
    locks: BuildLocks,
    /// 插入与容量淘汰互斥，保证条目数不超过容量
    insert_lock: Mutex<()>,
    capacity: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// 临时规则缓存
///
/// 克隆后共享同一份缓存，可在多个服务实例间共用。
pub struct AdhocCache<E: RuleEngine> {
    inner: Arc<Inner<E>>,
}

impl<E: RuleEngine> Clone for AdhocCache<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: RuleEngine> AdhocCache<E> {
    pub fn new(
        engine: Arc<E>,
        compiler: RuleCompiler,
        capacity: usize,
        ttl: Duration,
        lock_shards: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                compiler,
                entries: DashMap::new(),
                locks: BuildLocks::new(lock_shards),
                insert_lock: Mutex::new(()),
                capacity: capacity.max(1),
                ttl,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    /// 获取或构建临时规则产物
    #[instrument(skip(self, ctx, definition), fields(rule = %definition.label()))]
    pub async fn get_or_build(
        &self,
        ctx: &RequestContext,
        definition: &RuleDefinition,
    ) -> Result<Arc<CompiledArtifact<E::Artifact>>> {
        let fingerprint = definition.fingerprint()?;

        if let Some(artifact) = self.lookup(&fingerprint) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_artifact_lookup("adhoc", true);
            debug!(fingerprint = %fingerprint, "临时规则缓存命中");
            return Ok(artifact);
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_artifact_lookup("adhoc", false);
        ctx.check()?;

        let inner = self.inner.clone();
        let definition = definition.clone();
        let key = fingerprint.clone();
        let build = tokio::spawn(async move { inner.build_locked(key, definition).await });

        tokio::select! {
            joined = build => joined.map_err(|e| RuleError::BuildError {
                key: fingerprint.clone(),
                message: format!("构建任务异常终止: {}", e),
            })?,
            _ = ctx.cancelled() => Err(RuleError::Cancelled),
        }
    }

    /// 查找未过期条目并递增命中次数
    ///
    /// 过期条目交给后台任务删除，本次按未命中处理。
    fn lookup(&self, fingerprint: &str) -> Option<Arc<CompiledArtifact<E::Artifact>>> {
        let entry = self
            .inner
            .entries
            .get(fingerprint)
            .map(|e| e.value().clone())?;
        entry.hits.fetch_add(1, Ordering::Relaxed);

        if entry.created_at.elapsed() > self.inner.ttl {
            debug!(fingerprint = %fingerprint, "临时规则缓存条目已过期");
            let inner = self.inner.clone();
            let key = fingerprint.to_string();
            tokio::spawn(async move {
                if inner
                    .entries
                    .remove_if(&key, |_, current| Arc::ptr_eq(current, &entry))
                    .is_some()
                {
                    metrics::record_adhoc_eviction("expired", 1);
                }
            });
            return None;
        }

        Some(entry.artifact.clone())
    }

    /// 删除某个指纹的条目
    pub fn invalidate(&self, fingerprint: &str) -> bool {
        self.inner.entries.remove(fingerprint).is_some()
    }

    /// 清空全部条目，返回清除数量
    pub fn clear(&self) -> usize {
        let _insert = self.inner.insert_lock.lock();
        let count = self.inner.entries.len();
        self.inner.entries.clear();
        info!(count, "临时规则缓存已清空");
        count
    }

    /// 清理全部过期条目，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let _insert = self.inner.insert_lock.lock();
        self.inner.purge_expired_locked()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.inner.entries.contains_key(fingerprint)
    }

    pub fn stats(&self) -> AdhocStats {
        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        AdhocStats {
            entries: self.len(),
            hit_rate: hit_rate(hits, misses),
            capacity: self.inner.capacity,
            hits,
            misses,
        }
    }
}

impl<E: RuleEngine> Inner<E> {
    async fn build_locked(
        &self,
        fingerprint: String,
        definition: RuleDefinition,
    ) -> Result<Arc<CompiledArtifact<E::Artifact>>> {
        let _guard = self.locks.lock(&fingerprint).await;

        if let Some(entry) = self.entries.get(&fingerprint)
            && entry.created_at.elapsed() <= self.ttl
        {
            return Ok(entry.artifact.clone());
        }

        let started = std::time::Instant::now();
        let result = self.build(&fingerprint, &definition).await;
        metrics::record_artifact_build("adhoc", result.is_ok(), started.elapsed().as_secs_f64());
        let artifact = Arc::new(result.inspect_err(|e| {
            warn!(fingerprint = %fingerprint, error = %e, "临时规则构建失败");
        })?);

        self.insert(fingerprint, artifact.clone());
        Ok(artifact)
    }

    async fn build(
        &self,
        fingerprint: &str,
        definition: &RuleDefinition,
    ) -> Result<CompiledArtifact<E::Artifact>> {
        let compiled = self.compiler.compile(definition);
        metrics::record_rule_compilation(definition_form(definition), compiled.is_ok());
        let text = compiled?;

        let engine = self.engine.clone();
        let unit_id = format!("adhoc_{}", &fingerprint[..fingerprint.len().min(16)]);
        let built = tokio::task::spawn_blocking(move || engine.build(&text, &unit_id))
            .await
            .map_err(|e| RuleError::BuildError {
                key: fingerprint.to_string(),
                message: format!("构建线程异常终止: {}", e),
            })?
            .map_err(|e| RuleError::BuildError {
                key: fingerprint.to_string(),
                message: e.to_string(),
            })?;

        Ok(CompiledArtifact::new(fingerprint, "adhoc", 1, built))
    }

    fn insert(&self, fingerprint: String, artifact: Arc<CompiledArtifact<E::Artifact>>) {
        let _insert = self.insert_lock.lock();

        if !self.entries.contains_key(&fingerprint) && self.entries.len() >= self.capacity {
            self.purge_expired_locked();
            if self.entries.len() >= self.capacity {
                self.evict_least_valuable();
            }
        }

        self.entries.insert(
            fingerprint,
            Arc::new(AdhocEntry {
                artifact,
                created_at: Instant::now(),
                hits: AtomicU64::new(1),
            }),
        );
    }

    fn purge_expired_locked(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.created_at.elapsed() <= self.ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            metrics::record_adhoc_eviction("expired", removed as u64);
            debug!(removed, "已清理过期的临时规则");
        }
        removed
    }

    /// 按命中次数升序、创建时间升序淘汰约 10% 的条目（至少 1 个）
    fn evict_least_valuable(&self) {
        let mut candidates: Vec<(String, u64, Instant)> = self
            .entries
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.value().hits.load(Ordering::Relaxed),
                    e.value().created_at,
                )
            })
            .collect();
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

        let count = (self.capacity / 10).max(1).min(candidates.len());
        for (key, _, _) in candidates.into_iter().take(count) {
            self.entries.remove(&key);
        }

        metrics::record_adhoc_eviction("capacity", count as u64);
        info!(evicted = count, capacity = self.capacity, "临时规则缓存已满，淘汰低价值条目");
    }
}
