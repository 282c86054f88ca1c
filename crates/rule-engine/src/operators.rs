//! 条件操作符定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 条件操作符
///
/// 简单条件使用比较类操作符，组合条件使用逻辑操作符。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    // 相等比较
    Eq,
    Neq,

    // 大小比较
    Gt,
    Gte,
    Lt,
    Lte,

    // 区间，右操作数为 [min, max]
    Between,

    // 成员检查
    In,
    NotIn,

    // 模式匹配（正则）
    Matches,

    // 逻辑组合
    And,
    Or,
    Not,
}

impl Operator {
    /// 比较操作符在规则语言中的符号
    pub fn comparison_symbol(&self) -> Option<&'static str> {
        match self {
            Self::Eq => Some("=="),
            Self::Neq => Some("!="),
            Self::Gt => Some(">"),
            Self::Gte => Some(">="),
            Self::Lt => Some("<"),
            Self::Lte => Some("<="),
            _ => None,
        }
    }

    /// 是否为逻辑组合操作符
    pub fn is_logical(&self) -> bool {
        matches!(self, Self::And | Self::Or | Self::Not)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Between => "between",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::Matches => "matches",
            Self::And => "and",
            Self::Or => "or",
            Self::Not => "not",
        };
        write!(f, "{}", s)
    }
}
