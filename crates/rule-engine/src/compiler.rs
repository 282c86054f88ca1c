//! 规则编译器
//!
//! 把规则定义模型编译成规则语言文本，每条规则一个编译单元：
//!
//! ```text
//! rule vip_discount "VIP 折扣" salience 10 {
//!     when
//!         (user.level == "gold") && (order.amount >= 500)
//!     then
//!         Result["discount"] = 0.1;
//!         Retract("vip_discount");
//! }
//! ```
//!
//! 末尾的 `Retract` 保证规则在同一次执行中命中后不会再次触发。

use crate::error::{Result, RuleError};
use crate::models::{
    Action, ActionKind, Condition, ConditionKind, MetricRule, RuleDefinition, StructuredRule,
    TerseRule,
};
use crate::operators::Operator;
use crate::translator::{Dialect, Translator};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;
use uuid::Uuid;

/// 未设置优先级（或为 0）时使用的默认值
pub const DEFAULT_PRIORITY: i32 = 10;

/// 规则编译器
#[derive(Debug, Clone)]
pub struct RuleCompiler {
    default_priority: i32,
}

impl RuleCompiler {
    pub fn new() -> Self {
        Self {
            default_priority: DEFAULT_PRIORITY,
        }
    }

    pub fn with_default_priority(default_priority: i32) -> Self {
        Self { default_priority }
    }

    /// 从 JSON 字符串编译规则
    pub fn compile_from_json(&self, json: &str) -> Result<String> {
        let definition: RuleDefinition = serde_json::from_str(json)?;
        self.compile(&definition)
    }

    /// 编译单条规则定义
    pub fn compile(&self, definition: &RuleDefinition) -> Result<String> {
        let compiled = match definition {
            RuleDefinition::Structured(rule) => self.compile_structured(rule),
            RuleDefinition::Terse(rule) => self.compile_terse(rule),
            RuleDefinition::Metric(rule) => self.compile_metric(rule),
        };
        compiled.map_err(|e| e.within_rule(definition.label()))
    }

    /// 编译规则集
    ///
    /// 任一规则失败则整体失败，不返回部分结果。停用的结构化规则会被跳过。
    pub fn compile_set(&self, definitions: &[RuleDefinition]) -> Result<Vec<String>> {
        let mut compiled = Vec::with_capacity(definitions.len());
        for definition in definitions {
            if let RuleDefinition::Structured(rule) = definition
                && !rule.enabled
            {
                debug!(rule_id = %rule.id, "跳过已停用的规则");
                continue;
            }
            compiled.push(self.compile(definition)?);
        }
        Ok(compiled)
    }

    /// 拼接为一个规则集文本
    pub fn join(units: &[String]) -> String {
        units.join("\n\n")
    }

    fn compile_structured(&self, rule: &StructuredRule) -> Result<String> {
        let rule_id = sanitize_identifier(&rule.id);
        if rule_id.is_empty() {
            return Err(RuleError::compile(&rule.id, "规则 ID 不能为空"));
        }

        let condition = rule
            .condition
            .as_ref()
            .ok_or_else(|| RuleError::compile(&rule.id, "规则缺少条件"))?;
        if rule.actions.is_empty() {
            return Err(RuleError::compile(&rule.id, "规则缺少动作"));
        }

        let when = render_condition(condition, rule.dialect, &rule.id)?;
        let then = rule
            .actions
            .iter()
            .map(|action| render_action(action, rule.dialect, &rule.id))
            .collect::<Result<Vec<_>>>()?;

        Ok(emit_rule(
            &rule_id,
            &rule.description,
            self.priority(rule.priority),
            &when,
            &then,
        ))
    }

    fn compile_terse(&self, rule: &TerseRule) -> Result<String> {
        let rule_id = format!("terse_{}", Uuid::new_v4().simple());
        if rule.when.trim().is_empty() {
            return Err(RuleError::compile(&rule_id, "简写规则的条件不能为空"));
        }
        if rule.then.is_empty() {
            return Err(RuleError::compile(&rule_id, "简写规则的输出映射不能为空"));
        }

        let when = Translator::translate_condition(&rule.when, rule.dialect)
            .map_err(|e| e.within_rule(&rule_id))?;
        let then = rule
            .then
            .iter()
            .map(|(target, value)| match value {
                Value::String(expression) => {
                    Translator::translate_action(target, expression, rule.dialect)
                }
                literal => render_assign(target, literal),
            })
            .collect::<Result<Vec<_>>>()
            .map_err(|e| e.within_rule(&rule_id))?;

        Ok(emit_rule(&rule_id, "", self.default_priority, &when, &then))
    }

    fn compile_metric(&self, rule: &MetricRule) -> Result<String> {
        if rule.name.trim().is_empty() {
            return Err(RuleError::compile("metric", "指标名称不能为空"));
        }
        if rule.formula.trim().is_empty() {
            return Err(RuleError::compile(&rule.name, "指标公式不能为空"));
        }

        let metric_slot = sanitize_identifier(&rule.name);
        let rule_id = format!("metric_{}", metric_slot);

        let when = if rule.conditions.is_empty() {
            "true".to_string()
        } else {
            rule.conditions
                .iter()
                .map(|c| Translator::translate_condition(c, rule.dialect).map(|t| format!("({})", t)))
                .collect::<Result<Vec<_>>>()?
                .join(" && ")
        };

        let locals: BTreeSet<String> = rule.variables.keys().cloned().collect();
        let mut then = Vec::with_capacity(rule.variables.len() + 1);
        for (name, expression) in &rule.variables {
            let value = Translator::translate_value_with_locals(expression, rule.dialect, &locals)?;
            then.push(format!("{} = {};", Translator::output_slot(name)?, value));
        }
        let formula = Translator::translate_value_with_locals(&rule.formula, rule.dialect, &locals)?;
        then.push(format!("{} = {};", Translator::output_slot(&metric_slot)?, formula));

        Ok(emit_rule(
            &rule_id,
            &rule.description,
            self.default_priority,
            &when,
            &then,
        ))
    }

    fn priority(&self, priority: i32) -> i32 {
        if priority == 0 {
            self.default_priority
        } else {
            priority
        }
    }
}

impl Default for RuleCompiler {
    fn default() -> Self {
        Self::new()
    }
}

/// 非字母数字字符替换为 `_`
pub fn sanitize_identifier(id: &str) -> String {
    id.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn emit_rule(rule_id: &str, description: &str, priority: i32, when: &str, then: &[String]) -> String {
    let mut text = format!(
        "rule {} {} salience {} {{\n    when\n        {}\n    then\n",
        rule_id,
        Value::String(description.to_string()),
        priority,
        when
    );
    for line in then {
        text.push_str("        ");
        text.push_str(line);
        text.push('\n');
    }
    text.push_str(&format!("        Retract(\"{}\");\n}}", rule_id));
    text
}

/// 递归渲染条件树
fn render_condition(condition: &Condition, dialect: Dialect, rule_id: &str) -> Result<String> {
    match &condition.kind {
        ConditionKind::Simple => render_simple(condition, rule_id),
        ConditionKind::Composite => {
            if condition.children.is_empty() {
                return Err(RuleError::compile(rule_id, "组合条件至少需要一个子条件"));
            }
            let children = condition
                .children
                .iter()
                .map(|child| render_condition(child, dialect, rule_id).map(|c| format!("({})", c)))
                .collect::<Result<Vec<_>>>()?;

            match condition.operator.unwrap_or(Operator::And) {
                Operator::And => Ok(children.join(" && ")),
                Operator::Or => Ok(children.join(" || ")),
                Operator::Not => Ok(format!("!({})", children.join(" && "))),
                other => Err(RuleError::compile(
                    rule_id,
                    format!("组合条件不支持操作符 {}", other),
                )),
            }
        }
        ConditionKind::Expression => {
            let raw = condition
                .raw
                .as_deref()
                .ok_or_else(|| RuleError::compile(rule_id, "表达式条件缺少 raw"))?;
            Translator::translate_condition(raw, dialect)
        }
        ConditionKind::Function => {
            let raw = condition
                .raw
                .as_deref()
                .map(str::trim)
                .ok_or_else(|| RuleError::compile(rule_id, "函数条件缺少 raw"))?;
            if !raw.contains('(') || !raw.ends_with(')') {
                return Err(RuleError::compile(
                    rule_id,
                    format!("函数条件必须是函数调用: {}", raw),
                ));
            }
            Translator::translate_condition(raw, dialect)
        }
        ConditionKind::Unsupported(kind) => Err(RuleError::compile(
            rule_id,
            format!("不支持的条件类型: {}", kind),
        )),
    }
}

fn render_simple(condition: &Condition, rule_id: &str) -> Result<String> {
    let left = condition
        .left
        .as_deref()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| RuleError::compile(rule_id, "简单条件缺少左操作数"))?;
    let operator = condition
        .operator
        .ok_or_else(|| RuleError::compile(rule_id, format!("条件 '{}' 缺少操作符", left)))?;
    if operator.is_logical() {
        return Err(RuleError::compile(
            rule_id,
            format!("简单条件不支持逻辑操作符 {}", operator),
        ));
    }
    let right = condition
        .right
        .as_ref()
        .ok_or_else(|| RuleError::compile(rule_id, format!("条件 '{}' 缺少右操作数", left)))?;

    if let Some(symbol) = operator.comparison_symbol() {
        return Ok(format!("{} {} {}", left, symbol, Translator::literal(right)));
    }

    match operator {
        Operator::Between => match right.as_array().map(Vec::as_slice) {
            Some([low, high]) => Ok(format!(
                "{} >= {} && {} <= {}",
                left,
                Translator::literal(low),
                left,
                Translator::literal(high)
            )),
            _ => Err(RuleError::compile(
                rule_id,
                format!("条件 '{}' 的 between 操作符需要 [min, max] 数组", left),
            )),
        },
        Operator::In | Operator::NotIn => {
            let items: Vec<String> = match right {
                Value::Array(items) if !items.is_empty() => {
                    items.iter().map(Translator::literal).collect()
                }
                Value::Array(_) => {
                    return Err(RuleError::compile(
                        rule_id,
                        format!("条件 '{}' 的成员列表为空", left),
                    ));
                }
                scalar => vec![Translator::literal(scalar)],
            };
            let call = format!("In({}, {})", left, items.join(", "));
            Ok(if operator == Operator::NotIn {
                format!("!{}", call)
            } else {
                call
            })
        }
        Operator::Matches => {
            let pattern = right.as_str().ok_or_else(|| {
                RuleError::compile(rule_id, format!("条件 '{}' 的 matches 操作符需要字符串模式", left))
            })?;
            regex::Regex::new(pattern).map_err(|e| {
                RuleError::compile(rule_id, format!("条件 '{}' 的正则表达式无效: {}", left, e))
            })?;
            Ok(format!("Matches({}, {})", left, Translator::literal(right)))
        }
        other => Err(RuleError::compile(
            rule_id,
            format!("简单条件不支持操作符 {}", other),
        )),
    }
}

fn render_assign(target: &str, value: &Value) -> Result<String> {
    Ok(format!(
        "{} = {};",
        Translator::output_slot(target)?,
        Translator::literal(value)
    ))
}

fn render_action(action: &Action, dialect: Dialect, rule_id: &str) -> Result<String> {
    let target = action.target.as_deref().map(str::trim).filter(|t| !t.is_empty());

    match &action.kind {
        ActionKind::Assign => {
            let target =
                target.ok_or_else(|| RuleError::compile(rule_id, "assign 动作缺少 target"))?;
            render_assign(target, action.value.as_ref().unwrap_or(&Value::Null))
        }
        ActionKind::Compute => {
            let target =
                target.ok_or_else(|| RuleError::compile(rule_id, "compute 动作缺少 target"))?;
            let expression = action
                .expression
                .as_deref()
                .ok_or_else(|| RuleError::compile(rule_id, "compute 动作缺少 expression"))?;
            Translator::translate_action(target, expression, dialect)
        }
        ActionKind::Invoke => {
            let callable =
                target.ok_or_else(|| RuleError::compile(rule_id, "invoke 动作缺少被调用函数名"))?;
            if !callable
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
            {
                return Err(RuleError::compile(
                    rule_id,
                    format!("非法的函数名: {}", callable),
                ));
            }
            let params: Vec<String> = action
                .parameters
                .iter()
                .map(|(name, value)| format!("{}={}", name, Translator::literal(value)))
                .collect();
            Ok(format!("{}({});", callable, params.join(", ")))
        }
        ActionKind::Log => Ok(format!("Log({});", render_message(action, rule_id)?)),
        ActionKind::Alert => Ok(format!("Alert({});", render_message(action, rule_id)?)),
        ActionKind::Stop => Ok("Complete();".to_string()),
        ActionKind::Unsupported(kind) => Err(RuleError::compile(
            rule_id,
            format!("不支持的动作类型: {}", kind),
        )),
    }
}

fn render_message(action: &Action, rule_id: &str) -> Result<String> {
    action
        .value
        .as_ref()
        .map(Translator::literal)
        .ok_or_else(|| RuleError::compile(rule_id, format!("{} 动作缺少 value", action.kind)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn structured(condition: Condition, actions: Vec<Action>) -> RuleDefinition {
        RuleDefinition::Structured(StructuredRule::new("rule-001", condition, actions))
    }

    #[test]
    fn test_compile_structured_rule() {
        let def = RuleDefinition::Structured(
            StructuredRule::new(
                "vip-discount",
                Condition::and(vec![
                    Condition::simple("a", Operator::Gt, 1),
                    Condition::simple("b", Operator::Eq, "x"),
                ]),
                vec![Action::assign("discount", 0.1)],
            )
            .with_description("VIP 折扣"),
        );

        let text = RuleCompiler::new().compile(&def).unwrap();
        assert!(text.starts_with("rule vip_discount \"VIP 折扣\" salience 10 {"));
        assert!(text.contains(r#"(a > 1) && (b == "x")"#));
        assert!(text.contains(r#"Result["discount"] = 0.1;"#));
        assert!(text.trim_end().ends_with("Retract(\"vip_discount\");\n}"));
    }

    #[test]
    fn test_between_expands_to_two_comparisons() {
        let def = structured(
            Condition::simple("age", Operator::Between, json!([18, 65])),
            vec![Action::assign("adult", true)],
        );
        let text = RuleCompiler::new().compile(&def).unwrap();
        assert!(text.contains("age >= 18 && age <= 65"));
    }

    #[test]
    fn test_between_requires_pair() {
        let def = structured(
            Condition::simple("age", Operator::Between, json!([18])),
            vec![Action::assign("adult", true)],
        );
        let err = RuleCompiler::new().compile(&def).unwrap_err();
        assert!(matches!(err, RuleError::CompileError { .. }));
    }

    #[test]
    fn test_membership_and_pattern() {
        let def = structured(
            Condition::or(vec![
                Condition::simple("city", Operator::In, json!(["sh", "bj"])),
                Condition::simple("code", Operator::NotIn, json!([1, 2])),
                Condition::simple("email", Operator::Matches, "^.+@corp\\.com$"),
            ]),
            vec![Action::log("hit")],
        );
        let text = RuleCompiler::new().compile(&def).unwrap();
        assert!(text.contains(r#"(In(city, "sh", "bj")) || (!In(code, 1, 2)) || (Matches(email, "#));
        assert!(text.contains(r#"Log("hit");"#));
    }

    #[test]
    fn test_empty_composite_is_error() {
        let def = structured(Condition::and(vec![]), vec![Action::assign("x", 1)]);
        let err = RuleCompiler::new().compile(&def).unwrap_err();
        match err {
            RuleError::CompileError { rule_id, message } => {
                assert_eq!(rule_id, "rule-001");
                assert!(message.contains("组合条件"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unsupported_kinds() {
        let mut condition = Condition::expression("a > 1");
        condition.kind = ConditionKind::Unsupported("fuzzy".into());
        let err = RuleCompiler::new()
            .compile(&structured(condition, vec![Action::assign("x", 1)]))
            .unwrap_err();
        assert!(err.to_string().contains("不支持的条件类型"));

        let mut action = Action::stop();
        action.kind = ActionKind::Unsupported("email".into());
        let err = RuleCompiler::new()
            .compile(&structured(Condition::expression("a > 1"), vec![action]))
            .unwrap_err();
        assert!(err.to_string().contains("不支持的动作类型"));
    }

    #[test]
    fn test_translator_error_carries_rule_and_expression() {
        let def = structured(Condition::expression("age >"), vec![Action::assign("x", 1)]);
        let err = RuleCompiler::new().compile(&def).unwrap_err();
        match err {
            RuleError::CompileError { rule_id, message } => {
                assert_eq!(rule_id, "rule-001");
                assert!(message.contains("age >"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_actions_rendering() {
        let mut params = BTreeMap::new();
        params.insert("amount".to_string(), json!(10));
        params.insert("code".to_string(), json!("NEW"));
        let def = structured(
            Condition::function("IsWorkday(order.date)"),
            vec![
                Action::compute("points", "order.amount * 2"),
                Action::invoke("Coupon.Grant", params),
                Action::alert("large order"),
                Action::stop(),
            ],
        );
        let text = RuleCompiler::new().compile(&def).unwrap();
        assert!(text.contains("IsWorkday(order.date)"));
        assert!(text.contains(r#"Result["points"] = order.amount * 2;"#));
        assert!(text.contains(r#"Coupon.Grant(amount=10, code="NEW");"#));
        assert!(text.contains(r#"Alert("large order");"#));
        assert!(text.contains("Complete();"));
    }

    #[test]
    fn test_priority_default_and_explicit() {
        let base = StructuredRule::new("r", Condition::expression("a > 1"), vec![Action::stop()]);
        let compiler = RuleCompiler::with_default_priority(7);
        let text = compiler.compile(&base.clone().into()).unwrap();
        assert!(text.contains("salience 7"));
        let text = compiler.compile(&base.with_priority(50).into()).unwrap();
        assert!(text.contains("salience 50"));
    }

    #[test]
    fn test_missing_condition_or_actions() {
        let mut rule = StructuredRule::new("r", Condition::expression("a > 1"), vec![]);
        assert!(RuleCompiler::new().compile(&rule.clone().into()).is_err());
        rule.actions.push(Action::stop());
        rule.condition = None;
        assert!(RuleCompiler::new().compile(&rule.into()).is_err());
    }

    #[test]
    fn test_compile_terse_rule() {
        let mut then = BTreeMap::new();
        then.insert("level".to_string(), json!("'gold'"));
        then.insert("bonus".to_string(), json!(100));
        let rule = TerseRule {
            when: "score >= 90 && vip === true".to_string(),
            then,
            dialect: Dialect::Script,
        };
        let text = RuleCompiler::new().compile(&rule.into()).unwrap();
        assert!(text.starts_with("rule terse_"));
        assert!(text.contains("score >= 90 && vip == true"));
        assert!(text.contains(r#"Result["bonus"] = 100;"#));
        assert!(text.contains(r#"Result["level"] = "gold";"#));
    }

    #[test]
    fn test_terse_rule_requires_content() {
        let rule = TerseRule::new("", BTreeMap::new());
        assert!(RuleCompiler::new().compile(&rule.into()).is_err());
    }

    #[test]
    fn test_compile_metric_rule() {
        let mut variables = BTreeMap::new();
        variables.insert("revenue".to_string(), "order.amount - order.refund".to_string());
        let rule = MetricRule {
            name: "avg-price".to_string(),
            description: "平均单价".to_string(),
            formula: "revenue / order.count".to_string(),
            variables,
            conditions: vec!["order.count > 0".to_string(), "order.amount > 0".to_string()],
            dialect: Dialect::Relational,
        };
        let text = RuleCompiler::new().compile(&rule.into()).unwrap();
        assert!(text.starts_with("rule metric_avg_price"));
        assert!(text.contains("(order.count > 0) && (order.amount > 0)"));
        assert!(text.contains(r#"Result["revenue"] = order.amount - order.refund;"#));
        assert!(text.contains(r#"Result["avg_price"] = Result["revenue"] / order.count;"#));
    }

    #[test]
    fn test_metric_without_conditions_is_unconditional() {
        let rule = MetricRule {
            name: "total".to_string(),
            description: String::new(),
            formula: "a + b".to_string(),
            variables: BTreeMap::new(),
            conditions: vec![],
            dialect: Dialect::Script,
        };
        let text = RuleCompiler::new().compile(&rule.into()).unwrap();
        assert!(text.contains("    when\n        true\n"));
    }

    #[test]
    fn test_compile_is_idempotent() {
        let def = structured(
            Condition::and(vec![
                Condition::simple("a", Operator::Gt, 1),
                Condition::expression("b LIKE 'x%'"),
            ]),
            vec![Action::assign("x", 1)],
        );
        let compiler = RuleCompiler::new();
        assert_eq!(compiler.compile(&def).unwrap(), compiler.compile(&def.clone()).unwrap());
    }

    #[test]
    fn test_compile_set_fails_whole_set() {
        let good = structured(Condition::expression("a > 1"), vec![Action::assign("x", 1)]);
        let bad = RuleDefinition::Structured(StructuredRule::new(
            "bad-rule",
            Condition::or(vec![]),
            vec![Action::assign("x", 1)],
        ));
        let err = RuleCompiler::new().compile_set(&[good.clone(), bad]).unwrap_err();
        assert!(err.to_string().contains("bad-rule"));

        let units = RuleCompiler::new().compile_set(&[good.clone(), good]).unwrap();
        assert_eq!(units.len(), 2);
        assert!(RuleCompiler::join(&units).contains("}\n\nrule rule_001"));
    }

    #[test]
    fn test_compile_set_skips_disabled() {
        let mut rule = StructuredRule::new("off", Condition::expression("a > 1"), vec![Action::stop()]);
        rule.enabled = false;
        let units = RuleCompiler::new().compile_set(&[rule.into()]).unwrap();
        assert!(units.is_empty());
    }
}
