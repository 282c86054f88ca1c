//! 规则定义领域模型
//!
//! 三种编写形态（结构化、简写 when/then、指标公式）共用同一套模型，
//! 由 [`RuleDefinition`] 这个封闭的标签联合承载，编译器按标签分派。

use crate::error::Result;
use crate::operators::Operator;
use crate::translator::Dialect;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// 条件节点类型
///
/// 未知类型在反序列化时不会报错，而是保留原名，交给编译器报告
/// "unsupported condition kind"。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConditionKind {
    Simple,
    Composite,
    Expression,
    Function,
    Unsupported(String),
}

impl From<String> for ConditionKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "simple" => Self::Simple,
            "composite" => Self::Composite,
            "expression" => Self::Expression,
            "function" => Self::Function,
            _ => Self::Unsupported(s),
        }
    }
}

impl From<ConditionKind> for String {
    fn from(kind: ConditionKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Composite => write!(f, "composite"),
            Self::Expression => write!(f, "expression"),
            Self::Function => write!(f, "function"),
            Self::Unsupported(s) => write!(f, "{}", s),
        }
    }
}

/// 条件树节点
///
/// 按 `kind` 只填充一组字段：
/// - `simple`: `left` + `operator` + `right`
/// - `composite`: `operator` + `children`
/// - `expression` / `function`: `raw`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub kind: ConditionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<Operator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl Condition {
    pub fn simple(left: impl Into<String>, operator: Operator, right: impl Into<Value>) -> Self {
        Self {
            kind: ConditionKind::Simple,
            left: Some(left.into()),
            operator: Some(operator),
            right: Some(right.into()),
            children: Vec::new(),
            raw: None,
        }
    }

    pub fn composite(operator: Operator, children: Vec<Condition>) -> Self {
        Self {
            kind: ConditionKind::Composite,
            left: None,
            operator: Some(operator),
            right: None,
            children,
            raw: None,
        }
    }

    pub fn and(children: Vec<Condition>) -> Self {
        Self::composite(Operator::And, children)
    }

    pub fn or(children: Vec<Condition>) -> Self {
        Self::composite(Operator::Or, children)
    }

    /// 方言原文表达式
    pub fn expression(raw: impl Into<String>) -> Self {
        Self::raw_node(ConditionKind::Expression, raw.into())
    }

    /// 函数调用原文，如 `IsWorkday(order.date)`
    pub fn function(raw: impl Into<String>) -> Self {
        Self::raw_node(ConditionKind::Function, raw.into())
    }

    fn raw_node(kind: ConditionKind, raw: String) -> Self {
        Self {
            kind,
            left: None,
            operator: None,
            right: None,
            children: Vec::new(),
            raw: Some(raw),
        }
    }
}

/// 动作类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionKind {
    Assign,
    Compute,
    Invoke,
    Alert,
    Log,
    Stop,
    Unsupported(String),
}

impl From<String> for ActionKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "assign" => Self::Assign,
            "compute" => Self::Compute,
            "invoke" => Self::Invoke,
            "alert" => Self::Alert,
            "log" => Self::Log,
            "stop" => Self::Stop,
            _ => Self::Unsupported(s),
        }
    }
}

impl From<ActionKind> for String {
    fn from(kind: ActionKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Assign => "assign",
            Self::Compute => "compute",
            Self::Invoke => "invoke",
            Self::Alert => "alert",
            Self::Log => "log",
            Self::Stop => "stop",
            Self::Unsupported(s) => s.as_str(),
        };
        write!(f, "{}", s)
    }
}

/// 规则命中后执行的动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    /// 输出绑定中的目标路径（点号分隔），invoke 时为被调用函数名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
}

impl Action {
    fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            target: None,
            value: None,
            expression: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn assign(target: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            target: Some(target.into()),
            value: Some(value.into()),
            ..Self::new(ActionKind::Assign)
        }
    }

    pub fn compute(target: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            expression: Some(expression.into()),
            ..Self::new(ActionKind::Compute)
        }
    }

    pub fn invoke(target: impl Into<String>, parameters: BTreeMap<String, Value>) -> Self {
        Self {
            target: Some(target.into()),
            parameters,
            ..Self::new(ActionKind::Invoke)
        }
    }

    pub fn log(message: impl Into<Value>) -> Self {
        Self {
            value: Some(message.into()),
            ..Self::new(ActionKind::Log)
        }
    }

    pub fn alert(message: impl Into<Value>) -> Self {
        Self {
            value: Some(message.into()),
            ..Self::new(ActionKind::Alert)
        }
    }

    pub fn stop() -> Self {
        Self::new(ActionKind::Stop)
    }
}

/// 结构化规则：条件树 + 有序动作列表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 为 0 时编译器使用默认优先级
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub dialect: Dialect,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

fn default_enabled() -> bool {
    true
}

impl StructuredRule {
    pub fn new(id: impl Into<String>, condition: Condition, actions: Vec<Action>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            priority: 0,
            enabled: true,
            tags: BTreeSet::new(),
            dialect: Dialect::default(),
            condition: Some(condition),
            actions,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }
}

/// 简写规则：单个条件表达式 + 输出路径到值/表达式的映射
///
/// 映射值为字符串时按表达式翻译，其余 JSON 值按字面量赋值。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerseRule {
    pub when: String,
    pub then: BTreeMap<String, Value>,
    #[serde(default)]
    pub dialect: Dialect,
}

impl TerseRule {
    pub fn new(when: impl Into<String>, then: BTreeMap<String, Value>) -> Self {
        Self {
            when: when.into(),
            then,
            dialect: Dialect::default(),
        }
    }
}

/// 指标规则：前置条件 + 子变量 + 公式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub formula: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub dialect: Dialect,
}

/// 规则定义（三种编写形态之一）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleDefinition {
    Structured(StructuredRule),
    Terse(TerseRule),
    Metric(MetricRule),
}

impl RuleDefinition {
    /// 便于日志和错误定位的标识
    pub fn label(&self) -> &str {
        match self {
            Self::Structured(rule) => &rule.id,
            Self::Terse(_) => "terse",
            Self::Metric(rule) => &rule.name,
        }
    }

    /// 内容指纹：规范化序列化后的 SHA-256
    ///
    /// 对象键按字典序输出，结构相同的定义得到相同指纹，与构造位置无关。
    pub fn fingerprint(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        let mut canonical = String::new();
        write_canonical(&value, &mut canonical)?;

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}

impl From<StructuredRule> for RuleDefinition {
    fn from(rule: StructuredRule) -> Self {
        Self::Structured(rule)
    }
}

impl From<TerseRule> for RuleDefinition {
    fn from(rule: TerseRule) -> Self {
        Self::Terse(rule)
    }
}

impl From<MetricRule> for RuleDefinition {
    fn from(rule: MetricRule) -> Self {
        Self::Metric(rule)
    }
}

/// 规范化 JSON 输出（对象键排序，无多余空白）
fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, child)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(child, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, child) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(child, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

/// 持久化的规则记录
///
/// 由外部的规则编写流程写入，本子系统只读。`rule_text` 为已编译好的
/// 规则语言文本；为空时使用 `definition` 中的 JSON 规则定义现场编译。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RuleRecord {
    pub id: i64,
    pub business_id: String,
    pub name: String,
    #[serde(default)]
    pub rule_text: String,
    #[serde(default)]
    pub definition: Option<Value>,
    pub enabled: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
