//! 规则记录仓储
//!
//! 存储层只提供按业务标识的简单读取，规则的写入由外部编写流程负责。

use async_trait::async_trait;
use decision_shared::error::SharedError;
use sqlx::PgPool;

use crate::error::Result;
use crate::models::RuleRecord;

/// 规则记录仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// 按业务标识读取规则记录，版本号降序
    async fn find_rules(&self, business_id: &str, enabled_only: bool) -> Result<Vec<RuleRecord>>;

    /// 存储中出现过的全部业务标识，包括规则已全部停用的
    async fn list_business_ids(&self) -> Result<Vec<String>>;
}

/// PostgreSQL 规则仓储
pub struct PgRuleRepository {
    pool: PgPool,
}

impl PgRuleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RuleRepository for PgRuleRepository {
    async fn find_rules(&self, business_id: &str, enabled_only: bool) -> Result<Vec<RuleRecord>> {
        let records = sqlx::query_as::<_, RuleRecord>(
            r#"
            SELECT id, business_id, name, rule_text, definition, enabled, version,
                   created_at, updated_at
            FROM decision_rules
            WHERE business_id = $1
              AND ($2 = FALSE OR enabled = TRUE)
            ORDER BY version DESC, id ASC
            "#,
        )
        .bind(business_id)
        .bind(enabled_only)
        .fetch_all(&self.pool)
        .await
        .map_err(SharedError::from)?;

        Ok(records)
    }

    async fn list_business_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT business_id
            FROM decision_rules
            ORDER BY business_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(SharedError::from)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
