//! 后台同步任务
//!
//! - [`ArtifactSyncTask`]: 在进程内定期使全部产物失效，下次访问时重新编译
//! - [`RecordRefreshTask`]: 定期从存储刷新规则记录缓存，并预编译存储的规则定义，
//!   尽早暴露无法编译的规则
//!
//! 两个任务都在收到停机信号后退出。

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::cache::artifact_cache::compile_records;
use crate::cache::{ArtifactCache, RuleRecordCache};
use crate::compiler::RuleCompiler;
use crate::context::RequestContext;
use crate::engine::RuleEngine;

/// 产物定期失效任务
pub struct ArtifactSyncTask<E: RuleEngine> {
    artifacts: ArtifactCache<E>,
    interval: Duration,
}

impl<E: RuleEngine> ArtifactSyncTask<E> {
    pub fn new(artifacts: ArtifactCache<E>, interval: Duration) -> Self {
        Self {
            artifacts,
            interval,
        }
    }

    /// 运行直到停机信号；间隔为零时直接返回
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        if self.interval.is_zero() {
            info!("产物同步任务已禁用");
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 第一次 tick 立即完成，跳过
        ticker.tick().await;
        info!(interval_secs = self.interval.as_secs(), "产物同步任务已启动");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let count = self.artifacts.invalidate_all();
                    info!(count, "定期同步：产物缓存已全部失效");
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("产物同步任务已停止");
                        break;
                    }
                }
            }
        }
    }
}

/// 单轮刷新结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub failed: usize,
    pub invalid: usize,
}

/// 规则记录刷新任务
pub struct RecordRefreshTask {
    records: Arc<RuleRecordCache>,
    compiler: RuleCompiler,
    interval: Duration,
}

impl RecordRefreshTask {
    pub fn new(records: Arc<RuleRecordCache>, compiler: RuleCompiler, interval: Duration) -> Self {
        Self {
            records,
            compiler,
            interval,
        }
    }

    /// 刷新全部业务标识的记录缓存
    pub async fn refresh_all(&self, ctx: &RequestContext) -> RefreshReport {
        let mut report = RefreshReport::default();

        let business_ids = match ctx.run(self.records.repository().list_business_ids()).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "读取业务标识列表失败");
                report.failed += 1;
                return report;
            }
        };

        for business_id in business_ids {
            if ctx.is_cancelled() {
                break;
            }
            match self.records.refresh(ctx, &business_id).await {
                Ok(records) => {
                    report.refreshed += 1;
                    if let Err(e) = compile_records(&self.compiler, &records) {
                        report.invalid += 1;
                        warn!(business_id = %business_id, error = %e, "存储中的规则无法编译");
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(business_id = %business_id, error = %e, "规则记录刷新失败");
                }
            }
        }

        report
    }

    /// 立即刷新一轮，之后按间隔刷新，直到停机信号；间隔为零时直接返回
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        if self.interval.is_zero() {
            info!("规则记录刷新任务已禁用");
            return;
        }

        let ctx = RequestContext::from_shutdown(shutdown_rx.clone());
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "规则记录刷新任务已启动");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.refresh_all(&ctx).await;
                    info!(
                        refreshed = report.refreshed,
                        failed = report.failed,
                        invalid = report.invalid,
                        "规则记录刷新完成"
                    );
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("规则记录刷新任务已停止");
                        break;
                    }
                }
            }
        }
    }
}
