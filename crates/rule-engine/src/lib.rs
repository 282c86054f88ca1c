//! 规则编译与产物缓存
//!
//! 业务方以数据形式描述决策逻辑，本库负责：
//! - 把结构化、简写、指标三种规则形态编译为规则语言文本
//! - 把关系型、脚本型两种方言的表达式翻译为规范形式
//! - 缓存存储中的规则记录（两级缓存 + 存储兜底）
//! - 缓存外部引擎构建的产物：按业务标识（每个键至多一次构建）和按内容指纹（TTL + 容量淘汰）
//!
//! 规则的匹配和执行由外部引擎完成，见 [`engine::RuleEngine`]。

pub mod cache;
pub mod compiler;
pub mod context;
pub mod engine;
pub mod error;
pub mod models;
pub mod operators;
pub mod repository;
pub mod service;
pub mod sync;
pub mod translator;

pub use cache::{
    AdhocCache, ArtifactCache, CacheStats, CacheStore, MemoryCacheStore, RedisCacheStore,
    RuleRecordCache, TieredCache,
};
pub use compiler::RuleCompiler;
pub use context::{CancelHandle, RequestContext};
pub use engine::{CompiledArtifact, EngineError, RuleEngine};
pub use error::{Result, RuleError};
pub use models::{
    Action, ActionKind, Condition, ConditionKind, MetricRule, RuleDefinition, RuleRecord,
    StructuredRule, TerseRule,
};
pub use operators::Operator;
pub use repository::{PgRuleRepository, RuleRepository};
pub use service::RuleService;
pub use sync::{ArtifactSyncTask, RecordRefreshTask};
pub use translator::{Dialect, Translator};
