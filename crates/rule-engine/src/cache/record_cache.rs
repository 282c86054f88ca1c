//! 规则记录缓存
//!
//! 查找顺序：主缓存 → （主缓存出错时）次级缓存 → 存储。存储返回至少一条
//! 记录时回写两级缓存，回写失败只记录日志。

use chrono::{DateTime, Utc};
use decision_shared::cache::CacheKey;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::store::TieredCache;
use crate::context::RequestContext;
use crate::error::{Result, RuleError};
use crate::models::RuleRecord;
use crate::repository::RuleRepository;

/// 缓存中的记录快照
#[derive(Debug, Serialize, Deserialize)]
struct CachedRecords {
    records: Vec<RuleRecord>,
    updated_at: DateTime<Utc>,
    /// 记录中的最大版本号
    version: i64,
}

impl CachedRecords {
    fn new(records: Vec<RuleRecord>) -> Self {
        let version = records.iter().map(|r| r.version).max().unwrap_or_default();
        Self {
            records,
            updated_at: Utc::now(),
            version,
        }
    }
}

/// 规则记录缓存
pub struct RuleRecordCache {
    tiers: TieredCache,
    repository: Arc<dyn RuleRepository>,
    ttl: Duration,
}

impl RuleRecordCache {
    pub fn new(tiers: TieredCache, repository: Arc<dyn RuleRepository>, ttl: Duration) -> Self {
        Self {
            tiers,
            repository,
            ttl,
        }
    }

    pub fn repository(&self) -> &Arc<dyn RuleRepository> {
        &self.repository
    }

    /// 读取某个业务标识下的启用规则
    ///
    /// 缓存层的错误都在本地降级处理，只有存储读取失败才会返回 `CacheIoError`。
    /// 没有任何启用规则时返回 `NotFound`。
    #[instrument(skip(self, ctx))]
    pub async fn get(&self, ctx: &RequestContext, business_id: &str) -> Result<Vec<RuleRecord>> {
        let key = CacheKey::rule_records(business_id);

        match ctx.run(self.tiers.get(&key)).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<CachedRecords>(&bytes) {
                Ok(cached) if !cached.records.is_empty() => {
                    debug!(business_id = %business_id, version = cached.version, "规则记录缓存命中");
                    return Ok(cached.records);
                }
                Ok(_) => debug!(business_id = %business_id, "缓存中的规则记录为空，改读存储"),
                Err(e) => {
                    warn!(business_id = %business_id, error = %e, "缓存内容无法解析，改读存储")
                }
            },
            Ok(None) => debug!(business_id = %business_id, "规则记录缓存未命中"),
            Err(RuleError::Cancelled) => return Err(RuleError::Cancelled),
            Err(e) => {
                warn!(business_id = %business_id, error = %e, "两级缓存均不可用，改读存储");
                decision_shared::observability::metrics::record_cache_fallback("secondary");
            }
        }

        let records = self.load(ctx, business_id).await?;
        self.populate(&key, &records).await;
        Ok(records)
    }

    /// 绕过缓存从存储重新加载并回写
    ///
    /// 存储中已没有启用规则时删除缓存键并返回空列表。
    #[instrument(skip(self, ctx))]
    pub async fn refresh(&self, ctx: &RequestContext, business_id: &str) -> Result<Vec<RuleRecord>> {
        let key = CacheKey::rule_records(business_id);
        match self.load(ctx, business_id).await {
            Ok(records) => {
                let snapshot = CachedRecords::new(records);
                self.tiers
                    .set(&key, &serde_json::to_vec(&snapshot)?, self.ttl)
                    .await?;
                info!(
                    business_id = %business_id,
                    count = snapshot.records.len(),
                    version = snapshot.version,
                    "规则记录缓存已刷新"
                );
                Ok(snapshot.records)
            }
            Err(RuleError::NotFound(_)) => {
                self.tiers.delete(&key).await?;
                info!(business_id = %business_id, "业务下已无启用规则，缓存已删除");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// 删除某个业务标识的缓存记录
    pub async fn invalidate(&self, business_id: &str) -> Result<()> {
        self.tiers.delete(&CacheKey::rule_records(business_id)).await
    }

    /// 关闭两级缓存
    pub async fn close(&self) -> Result<()> {
        self.tiers.close().await
    }

    async fn load(&self, ctx: &RequestContext, business_id: &str) -> Result<Vec<RuleRecord>> {
        let records = ctx
            .run(self.repository.find_rules(business_id, true))
            .await?;
        if records.is_empty() {
            return Err(RuleError::NotFound(business_id.to_string()));
        }
        Ok(records)
    }

    async fn populate(&self, key: &str, records: &[RuleRecord]) {
        let snapshot = CachedRecords::new(records.to_vec());
        let bytes = match serde_json::to_vec(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %key, error = %e, "规则记录序列化失败，跳过缓存回写");
                return;
            }
        };

        if let Err(e) = self.tiers.set(key, &bytes, self.ttl).await {
            warn!(key = %key, error = %e, "规则记录缓存回写失败");
        }
    }
}
