//! 规则记录缓存同步服务
//!
//! 定期从存储刷新 Redis 中的规则记录缓存，并预编译存储的规则定义，
//! 使各业务进程读取到的记录保持新鲜。

use anyhow::Result;
use decision_shared::cache::Cache;
use decision_shared::config::AppConfig;
use decision_shared::database::Database;
use decision_shared::observability;
use rule_engine::{
    MemoryCacheStore, PgRuleRepository, RecordRefreshTask, RedisCacheStore, RuleCompiler,
    RuleRecordCache, TieredCache,
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "rule-cache-sync";

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("加载配置失败，使用默认配置: {}", e);
        AppConfig::default()
    });

    let _guard = observability::init(&config.service_name, &config.observability).await?;
    info!(environment = %config.environment, "正在启动 {}...", SERVICE_NAME);

    let database = Database::connect(&config.database).await?;
    let redis = Cache::new(&config.redis)?;
    if let Err(e) = redis.health_check().await {
        warn!(error = %e, "Redis 暂不可用，刷新结果只写入本地缓存");
    }

    let repository = Arc::new(PgRuleRepository::new(database.pool().clone()));
    let tiers = TieredCache::new(
        Arc::new(RedisCacheStore::new(redis)),
        Arc::new(MemoryCacheStore::new()),
    );
    let records = Arc::new(RuleRecordCache::new(
        tiers,
        repository,
        config.rule_cache.record_ttl(),
    ));

    let task = RecordRefreshTask::new(
        records.clone(),
        RuleCompiler::with_default_priority(config.rule_cache.default_priority),
        config.rule_cache.sync_interval(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(task.run(shutdown_rx));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    if let Err(e) = worker.await {
        error!(error = %e, "刷新任务异常退出");
    }
    if let Err(e) = records.close().await {
        warn!(error = %e, "关闭规则记录缓存失败");
    }
    database.close().await;

    info!("服务已停止");
    Ok(())
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "无法监听 Ctrl+C 信号");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "无法监听 SIGTERM 信号");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
        _ = terminate => {
            info!("收到 SIGTERM，开始优雅关闭...");
        }
    }
}
