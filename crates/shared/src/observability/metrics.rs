//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "rule_compilations_total",
        "Total number of rule definition compilations"
    );
    metrics::describe_counter!(
        "rule_artifact_cache_requests_total",
        "Artifact cache lookups by outcome"
    );
    metrics::describe_counter!("rule_artifact_builds_total", "Total number of artifact builds");
    metrics::describe_histogram!(
        "rule_artifact_build_duration_seconds",
        "Artifact build duration in seconds"
    );
    metrics::describe_counter!(
        "rule_record_cache_fallback_total",
        "Rule record reads that fell through a cache tier"
    );
    metrics::describe_counter!(
        "adhoc_rule_cache_evictions_total",
        "Ad-hoc artifacts evicted by capacity or expiry"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("指标服务监听于 {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("指标服务错误: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录规则编译
#[inline]
pub fn record_rule_compilation(form: &str, success: bool) {
    metrics::counter!(
        "rule_compilations_total",
        "form" => form.to_string(),
        "status" => if success { "success" } else { "failure" }
    )
    .increment(1);
}

/// 记录构建产物缓存查询
#[inline]
pub fn record_artifact_lookup(cache: &'static str, hit: bool) {
    metrics::counter!(
        "rule_artifact_cache_requests_total",
        "cache" => cache,
        "outcome" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// 记录构建产物构建
#[inline]
pub fn record_artifact_build(cache: &'static str, success: bool, duration_secs: f64) {
    metrics::counter!(
        "rule_artifact_builds_total",
        "cache" => cache,
        "status" => if success { "success" } else { "failure" }
    )
    .increment(1);

    metrics::histogram!("rule_artifact_build_duration_seconds", "cache" => cache)
        .record(duration_secs);
}

/// 记录规则记录读取穿透某一级缓存
#[inline]
pub fn record_cache_fallback(tier: &'static str) {
    metrics::counter!("rule_record_cache_fallback_total", "tier" => tier).increment(1);
}

/// 记录临时规则缓存淘汰
#[inline]
pub fn record_adhoc_eviction(reason: &'static str, count: u64) {
    metrics::counter!("adhoc_rule_cache_evictions_total", "reason" => reason).increment(count);
}
