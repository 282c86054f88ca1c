//! 规则编译与缓存错误类型
//!
//! 对外只暴露一层错误：每个变体都自带出错的标识（表达式、规则 ID、
//! 业务标识或内容指纹），调用方无需逐层解包。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("表达式解析失败: {message} (表达式: `{expression}`)")]
    ParseError { expression: String, message: String },

    #[error("规则编译失败 [{rule_id}]: {message}")]
    CompileError { rule_id: String, message: String },

    #[error("规则构建失败 [{key}]: {message}")]
    BuildError { key: String, message: String },

    #[error("规则执行失败 [{key}]: {message}")]
    ExecutionError { key: String, message: String },

    #[error("缓存读写失败: {0}")]
    CacheIoError(String),

    #[error("规则未找到: business_id={0}")]
    NotFound(String),

    #[error("请求已取消或超时")]
    Cancelled,

    #[error("JSON 序列化错误: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RuleError>;

impl RuleError {
    pub fn parse(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ParseError {
            expression: expression.into(),
            message: message.into(),
        }
    }

    pub fn compile(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CompileError {
            rule_id: rule_id.into(),
            message: message.into(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::ParseError { .. } => "PARSE_ERROR",
            Self::CompileError { .. } => "COMPILE_ERROR",
            Self::BuildError { .. } => "BUILD_ERROR",
            Self::ExecutionError { .. } => "EXECUTION_ERROR",
            Self::CacheIoError(_) => "CACHE_IO_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Cancelled => "CANCELLED",
            Self::JsonError(_) => "JSON_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 编译和构建失败需要修正规则本身，重试没有意义。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CacheIoError(_) | Self::Cancelled)
    }

    /// 将解析错误挂到所属规则上，其余错误原样返回
    pub(crate) fn within_rule(self, rule_id: &str) -> Self {
        match self {
            Self::ParseError { .. } => Self::compile(rule_id, self.to_string()),
            other => other,
        }
    }
}

impl From<decision_shared::error::SharedError> for RuleError {
    fn from(err: decision_shared::error::SharedError) -> Self {
        Self::CacheIoError(err.to_string())
    }
}
