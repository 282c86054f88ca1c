//! 外部规则执行引擎的接入点
//!
//! 引擎负责把规则语言文本构建为可执行产物，并针对输入绑定执行产物。
//! 本子系统把两者都当作黑盒，只包装它们的错误。

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// 引擎返回的错误，原文透传
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// 外部规则执行引擎
///
/// 两个方法都是阻塞调用，缓存层在 `spawn_blocking` 中调用它们。
pub trait RuleEngine: Send + Sync + 'static {
    /// 构建产物
    type Artifact: Send + Sync + 'static;

    /// 从规则语言文本构建产物，`unit_id` 用于引擎侧的命名和诊断
    fn build(&self, rule_text: &str, unit_id: &str) -> Result<Self::Artifact, EngineError>;

    /// 执行产物，结果写入 `output`
    fn execute(
        &self,
        artifact: &Self::Artifact,
        input: &Value,
        output: &mut Map<String, Value>,
    ) -> Result<(), EngineError>;
}

/// 已构建的规则产物
///
/// 所有并发调用方共享同一个实例（通过 `Arc`）。
#[derive(Debug)]
pub struct CompiledArtifact<A> {
    /// 业务标识或内容指纹
    pub key: String,
    /// 版本标签，持久化规则取记录中的最大版本号
    pub version: String,
    /// 参与构建的规则单元数
    pub rule_count: usize,
    pub built_at: DateTime<Utc>,
    pub unit: A,
}

impl<A> CompiledArtifact<A> {
    pub fn new(key: impl Into<String>, version: impl Into<String>, rule_count: usize, unit: A) -> Self {
        Self {
            key: key.into(),
            version: version.into(),
            rule_count,
            built_at: Utc::now(),
            unit,
        }
    }
}
