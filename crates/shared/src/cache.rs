//! Redis 缓存管理模块
//!
//! Redis 连接管理和按原始字节读写的缓存操作。

use crate::config::RedisConfig;
use crate::error::{Result, SharedError};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tracing::{info, instrument};

/// Redis 缓存客户端
#[derive(Clone)]
pub struct Cache {
    client: Client,
    key_prefix: String,
}

impl Cache {
    /// 创建 Redis 客户端
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        info!("Redis 客户端已创建");
        Ok(Self {
            client,
            key_prefix: config.key_prefix.clone(),
        })
    }

    async fn get_conn(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(SharedError::from)
    }

    /// 加上全局前缀后的完整键
    pub fn full_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(SharedError::from)
    }

    /// 获取原始字节
    #[instrument(skip(self))]
    pub async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.get_conn().await?;
        let value: Option<Vec<u8>> = conn.get(self.full_key(key)).await?;
        Ok(value)
    }

    /// 写入原始字节并设置 TTL
    ///
    /// TTL 为零时不设置过期时间。
    #[instrument(skip(self, value))]
    pub async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let key = self.full_key(key);
        if ttl.is_zero() {
            let _: () = conn.set(key, value).await?;
        } else {
            let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        }
        Ok(())
    }

    /// 删除值
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let _: () = conn.del(self.full_key(key)).await?;
        Ok(())
    }
}

/// 缓存键生成器
pub struct CacheKey;

impl CacheKey {
    /// 某个业务标识下的规则记录
    pub fn rule_records(business_id: &str) -> String {
        format!("rule:records:{}", business_id)
    }
}
