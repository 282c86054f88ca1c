//! 规则服务
//!
//! 子系统的对外入口：编译、获取/构建产物、失效、统计，以及执行。

use decision_shared::config::RuleCacheConfig;
use decision_shared::observability::metrics;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::cache::artifact_cache::definition_form;
use crate::cache::{AdhocCache, ArtifactCache, CacheStats, RuleRecordCache};
use crate::compiler::RuleCompiler;
use crate::context::RequestContext;
use crate::engine::{CompiledArtifact, RuleEngine};
use crate::error::{Result, RuleError};
use crate::models::RuleDefinition;

/// 规则服务
pub struct RuleService<E: RuleEngine> {
    engine: Arc<E>,
    compiler: RuleCompiler,
    artifacts: ArtifactCache<E>,
    adhoc: AdhocCache<E>,
}

impl<E: RuleEngine> RuleService<E> {
    pub fn new(engine: Arc<E>, records: Arc<RuleRecordCache>, config: &RuleCacheConfig) -> Self {
        let compiler = RuleCompiler::with_default_priority(config.default_priority);
        let adhoc = AdhocCache::new(
            engine.clone(),
            compiler.clone(),
            config.adhoc_capacity,
            config.adhoc_ttl(),
            config.build_lock_shards,
        );
        Self::with_adhoc_cache(engine, records, config, adhoc)
    }

    /// 与其他服务实例共用同一个临时规则缓存
    pub fn with_adhoc_cache(
        engine: Arc<E>,
        records: Arc<RuleRecordCache>,
        config: &RuleCacheConfig,
        adhoc: AdhocCache<E>,
    ) -> Self {
        let compiler = RuleCompiler::with_default_priority(config.default_priority);
        let artifacts = ArtifactCache::new(
            engine.clone(),
            records,
            compiler.clone(),
            config.build_lock_shards,
        );
        Self {
            engine,
            compiler,
            artifacts,
            adhoc,
        }
    }

    pub fn artifact_cache(&self) -> &ArtifactCache<E> {
        &self.artifacts
    }

    pub fn adhoc_cache(&self) -> &AdhocCache<E> {
        &self.adhoc
    }

    /// 编译单条规则定义为规则语言文本
    pub fn compile(&self, definition: &RuleDefinition) -> Result<String> {
        let compiled = self.compiler.compile(definition);
        metrics::record_rule_compilation(definition_form(definition), compiled.is_ok());
        compiled
    }

    /// 编译规则集，任一失败整体失败
    pub fn compile_set(&self, definitions: &[RuleDefinition]) -> Result<Vec<String>> {
        self.compiler.compile_set(definitions)
    }

    /// 获取或构建业务标识对应的产物
    pub async fn get_or_build_artifact(
        &self,
        ctx: &RequestContext,
        business_id: &str,
    ) -> Result<Arc<CompiledArtifact<E::Artifact>>> {
        self.artifacts.get_or_build(ctx, business_id).await
    }

    /// 获取或构建临时规则产物
    pub async fn get_or_build_adhoc_artifact(
        &self,
        ctx: &RequestContext,
        definition: &RuleDefinition,
    ) -> Result<Arc<CompiledArtifact<E::Artifact>>> {
        self.adhoc.get_or_build(ctx, definition).await
    }

    /// 使业务标识的产物失效，下次访问时按当前记录缓存内容重新构建
    pub fn invalidate(&self, business_id: &str) -> bool {
        self.artifacts.invalidate(business_id)
    }

    /// 从存储重新加载记录并使产物失效
    #[instrument(skip(self, ctx))]
    pub async fn refresh(&self, ctx: &RequestContext, business_id: &str) -> Result<usize> {
        let records = self.artifacts.records().refresh(ctx, business_id).await?;
        self.artifacts.invalidate(business_id);
        Ok(records.len())
    }

    /// 清空产物缓存和临时规则缓存
    pub fn clear_all(&self) {
        let artifacts = self.artifacts.invalidate_all();
        let adhoc = self.adhoc.clear();
        info!(artifacts, adhoc, "规则产物缓存已全部清空");
    }

    pub fn stats(&self) -> CacheStats {
        let adhoc = self.adhoc.stats();
        CacheStats {
            entries: adhoc.entries,
            hit_rate: adhoc.hit_rate,
            capacity: adhoc.capacity,
            artifacts: self.artifacts.stats(),
        }
    }

    /// 执行业务标识下的规则，返回输出绑定
    #[instrument(skip(self, ctx, input))]
    pub async fn execute(
        &self,
        ctx: &RequestContext,
        business_id: &str,
        input: Value,
    ) -> Result<Map<String, Value>> {
        let artifact = self.get_or_build_artifact(ctx, business_id).await?;
        self.run(ctx, artifact, input).await
    }

    /// 执行临时规则，返回输出绑定
    #[instrument(skip(self, ctx, definition, input), fields(rule = %definition.label()))]
    pub async fn execute_adhoc(
        &self,
        ctx: &RequestContext,
        definition: &RuleDefinition,
        input: Value,
    ) -> Result<Map<String, Value>> {
        let artifact = self.get_or_build_adhoc_artifact(ctx, definition).await?;
        self.run(ctx, artifact, input).await
    }

    async fn run(
        &self,
        ctx: &RequestContext,
        artifact: Arc<CompiledArtifact<E::Artifact>>,
        input: Value,
    ) -> Result<Map<String, Value>> {
        let engine = self.engine.clone();
        let key = artifact.key.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut output = Map::new();
            engine
                .execute(&artifact.unit, &input, &mut output)
                .map(|_| output)
        });

        ctx.run(async {
            task.await
                .map_err(|e| RuleError::ExecutionError {
                    key: key.clone(),
                    message: format!("执行线程异常终止: {}", e),
                })?
                .map_err(|e| RuleError::ExecutionError {
                    key: key.clone(),
                    message: e.to_string(),
                })
        })
        .await
    }
}
