//! 业务产物缓存
//!
//! 每个业务标识的状态：`absent → building → ready`。构建在分片锁内完成，
//! 拿到锁后再检查一次，排队等待的调用方直接复用第一个构建者的结果。
//! 构建失败不缓存，下一次调用重新构建。
//!
//! 失效按业务标识计数：`invalidate(key)` 只推进该键的纪元，`invalidate_all`
//! 推进全局代数。构建结束时两者都未变化才写入缓存。

use dashmap::DashMap;
use decision_shared::observability::metrics;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, instrument};

use super::record_cache::RuleRecordCache;
use super::{BuildLocks, hit_rate};
use crate::compiler::RuleCompiler;
use crate::context::RequestContext;
use crate::engine::{CompiledArtifact, RuleEngine};
use crate::error::{Result, RuleError};
use crate::models::{RuleDefinition, RuleRecord};

/// 产物缓存统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArtifactCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub builds: u64,
    pub hit_rate: f64,
}

struct Inner<E: RuleEngine> {
    engine: Arc<E>,
    records: Arc<RuleRecordCache>,
    compiler: RuleCompiler,
    artifacts: DashMap<String, Arc<CompiledArtifact<E::Artifact>>>,
    locks: BuildLocks,
    /// 每个业务标识的失效纪元
    epochs: DashMap<String, u64>,
    /// `invalidate_all` 的代数
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
}

/// 业务产物缓存
pub struct ArtifactCache<E: RuleEngine> {
    inner: Arc<Inner<E>>,
}

impl<E: RuleEngine> Clone for ArtifactCache<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: RuleEngine> ArtifactCache<E> {
    pub fn new(
        engine: Arc<E>,
        records: Arc<RuleRecordCache>,
        compiler: RuleCompiler,
        lock_shards: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                records,
                compiler,
                artifacts: DashMap::new(),
                locks: BuildLocks::new(lock_shards),
                epochs: DashMap::new(),
                generation: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                builds: AtomicU64::new(0),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.inner.engine
    }

    pub fn records(&self) -> &Arc<RuleRecordCache> {
        &self.inner.records
    }

    /// 获取或构建业务标识对应的产物
    ///
    /// 构建在独立任务中进行：调用方被取消时返回 `Cancelled`，
    /// 已开始的构建继续完成并写入缓存，供后续调用复用。
    #[instrument(skip(self, ctx))]
    pub async fn get_or_build(
        &self,
        ctx: &RequestContext,
        business_id: &str,
    ) -> Result<Arc<CompiledArtifact<E::Artifact>>> {
        if let Some(artifact) = self.peek(business_id) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_artifact_lookup("business", true);
            debug!(business_id = %business_id, version = %artifact.version, "产物缓存命中");
            return Ok(artifact);
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_artifact_lookup("business", false);
        ctx.check()?;

        let inner = self.inner.clone();
        let key = business_id.to_string();
        let build = tokio::spawn(async move { inner.build_locked(&key).await });

        tokio::select! {
            joined = build => joined.map_err(|e| RuleError::BuildError {
                key: business_id.to_string(),
                message: format!("构建任务异常终止: {}", e),
            })?,
            _ = ctx.cancelled() => Err(RuleError::Cancelled),
        }
    }

    /// 只查缓存，不构建
    pub fn peek(&self, business_id: &str) -> Option<Arc<CompiledArtifact<E::Artifact>>> {
        self.inner
            .artifacts
            .get(business_id)
            .map(|entry| entry.value().clone())
    }

    /// 使某个业务标识的产物失效，返回是否存在
    pub fn invalidate(&self, business_id: &str) -> bool {
        // 持有纪元条目期间移除，与构建方的写入互斥
        let mut epoch = self
            .inner
            .epochs
            .entry(business_id.to_string())
            .or_insert(0);
        *epoch += 1;
        let removed = self.inner.artifacts.remove(business_id).is_some();
        drop(epoch);
        if removed {
            info!(business_id = %business_id, "产物缓存已失效");
        }
        removed
    }

    /// 使全部产物失效，返回清除数量
    pub fn invalidate_all(&self) -> usize {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let count = self.inner.artifacts.len();
        self.inner.artifacts.clear();
        info!(count, "全部产物缓存已失效");
        count
    }

    pub fn len(&self) -> usize {
        self.inner.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.artifacts.is_empty()
    }

    /// 当前缓存的业务标识
    pub fn keys(&self) -> Vec<String> {
        self.inner
            .artifacts
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn stats(&self) -> ArtifactCacheStats {
        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        ArtifactCacheStats {
            entries: self.len(),
            hits,
            misses,
            builds: self.inner.builds.load(Ordering::Relaxed),
            hit_rate: hit_rate(hits, misses),
        }
    }
}

impl<E: RuleEngine> Inner<E> {
    async fn build_locked(&self, business_id: &str) -> Result<Arc<CompiledArtifact<E::Artifact>>> {
        let _guard = self.locks.lock(business_id).await;

        if let Some(artifact) = self.artifacts.get(business_id) {
            debug!(business_id = %business_id, "等待期间产物已由其他调用方构建");
            return Ok(artifact.value().clone());
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let epoch = self.epoch_of(business_id);
        let started = Instant::now();
        let result = self.build(business_id).await;
        let elapsed = started.elapsed().as_secs_f64();
        metrics::record_artifact_build("business", result.is_ok(), elapsed);

        let artifact = match result {
            Ok(artifact) => Arc::new(artifact),
            Err(e) => {
                error!(business_id = %business_id, error = %e, "产物构建失败");
                return Err(e);
            }
        };
        self.builds.fetch_add(1, Ordering::Relaxed);

        if !self.store_if_current(business_id, &artifact, epoch, generation) {
            debug!(business_id = %business_id, "构建期间发生失效，产物不写入缓存");
        }

        info!(
            business_id = %business_id,
            version = %artifact.version,
            rules = artifact.rule_count,
            elapsed_ms = (elapsed * 1000.0) as u64,
            "产物构建完成"
        );
        Ok(artifact)
    }

    fn epoch_of(&self, business_id: &str) -> u64 {
        self.epochs.get(business_id).map(|e| *e).unwrap_or(0)
    }

    /// 构建开始后该键与全局都未失效时写入，返回是否写入
    fn store_if_current(
        &self,
        business_id: &str,
        artifact: &Arc<CompiledArtifact<E::Artifact>>,
        epoch: u64,
        generation: u64,
    ) -> bool {
        let current = self
            .epochs
            .entry(business_id.to_string())
            .or_insert(0);
        if *current != epoch || self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        self.artifacts
            .insert(business_id.to_string(), artifact.clone());
        drop(current);

        // 写入后全局失效已发生，撤回本次写入
        if self.generation.load(Ordering::SeqCst) != generation {
            self.artifacts
                .remove_if(business_id, |_, cached| Arc::ptr_eq(cached, artifact));
            return false;
        }
        true
    }

    async fn build(&self, business_id: &str) -> Result<CompiledArtifact<E::Artifact>> {
        let records = self
            .records
            .get(&RequestContext::background(), business_id)
            .await?;

        let units = compile_records(&self.compiler, &records)?;
        if units.is_empty() {
            return Err(RuleError::NotFound(business_id.to_string()));
        }
        let version = records.iter().map(|r| r.version).max().unwrap_or_default();

        let rule_count = units.len();
        let text = RuleCompiler::join(&units);
        let engine = self.engine.clone();
        let unit_id = business_id.to_string();
        let built = tokio::task::spawn_blocking(move || engine.build(&text, &unit_id))
            .await
            .map_err(|e| RuleError::BuildError {
                key: business_id.to_string(),
                message: format!("构建线程异常终止: {}", e),
            })?
            .map_err(|e| RuleError::BuildError {
                key: business_id.to_string(),
                message: e.to_string(),
            })?;

        Ok(CompiledArtifact::new(
            business_id,
            format!("v{}", version),
            rule_count,
            built,
        ))
    }
}

/// 把启用的规则记录整理为编译单元
///
/// 记录带有规则文本时直接使用；否则编译其中的 JSON 规则定义。
/// 任一记录失败则整体失败。
pub(crate) fn compile_records(compiler: &RuleCompiler, records: &[RuleRecord]) -> Result<Vec<String>> {
    let mut units = Vec::with_capacity(records.len());
    for record in records.iter().filter(|r| r.enabled) {
        if !record.rule_text.trim().is_empty() {
            units.push(record.rule_text.clone());
            continue;
        }

        let label = if record.name.is_empty() {
            record.id.to_string()
        } else {
            record.name.clone()
        };
        let definition = record
            .definition
            .clone()
            .ok_or_else(|| RuleError::compile(&label, "规则记录既没有规则文本也没有规则定义"))?;
        let definition: RuleDefinition = serde_json::from_value(definition)
            .map_err(|e| RuleError::compile(&label, format!("规则定义无法解析: {}", e)))?;
        let text = compiler.compile(&definition);
        metrics::record_rule_compilation(definition_form(&definition), text.is_ok());
        units.push(text?);
    }
    Ok(units)
}

pub(crate) fn definition_form(definition: &RuleDefinition) -> &'static str {
    match definition {
        RuleDefinition::Structured(_) => "structured",
        RuleDefinition::Terse(_) => "terse",
        RuleDefinition::Metric(_) => "metric",
    }
}
