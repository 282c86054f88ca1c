//! 规则库连接池
//!
//! 规则记录只读访问 PostgreSQL；连接串中的口令不进入日志。

use crate::config::DatabaseConfig;
use crate::error::{Result, SharedError};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// 连接池占用情况
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: u32,
    pub idle: usize,
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 按配置建立连接池，并用一次探测确认库可达
    #[instrument(skip_all, fields(endpoint = %redact_url(&config.url)))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections.min(config.max_connections))
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .test_before_acquire(true);

        let pool = options.connect(&config.url).await.map_err(|e| {
            warn!(error = %e, "连接规则库失败");
            SharedError::from(e)
        })?;

        let database = Self { pool };
        let latency = database.health_check().await?;
        let stats = database.stats();
        info!(
            max_connections = config.max_connections,
            size = stats.size,
            idle = stats.idle,
            latency_ms = latency.as_millis() as u64,
            "规则库连接池就绪"
        );

        Ok(database)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        }
    }

    /// 探测一次往返，返回耗时
    pub async fn health_check(&self) -> Result<Duration> {
        let started = Instant::now();
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(started.elapsed())
    }

    /// 等待在途查询结束后关闭
    pub async fn close(&self) {
        if self.pool.is_closed() {
            return;
        }
        let stats = self.stats();
        self.pool.close().await;
        info!(size = stats.size, "规则库连接池已关闭");
    }
}

/// 去掉连接串中的口令，只保留用户、主机和库名
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.rsplit_once('@') {
        Some((credentials, host)) => {
            let user = credentials.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        None => url.to_string(),
    }
}
