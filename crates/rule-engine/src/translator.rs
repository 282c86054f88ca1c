//! 表达式翻译器
//!
//! 把方言风格的条件/取值表达式规范化为规则语言可识别的操作符和函数调用。
//! 只做语法层面的替换和少量结构改写，不校验字段名（由外部引擎在构建时校验）。
//!
//! 支持两种方言：
//! - `Relational`: `AND`/`OR`/`NOT`、`=`/`<>`、`LIKE`、`IN (...)`、`BETWEEN a AND b`、`IS [NOT] NULL`
//! - `Script`: `&&`/`||`、`===`/`!==`、三元表达式、`.length`/`.includes()`/`.filter()` 等集合方法
//!
//! 规范形式中的结构改写：
//! - `x LIKE 'a%'` → `Matches(x, "^a.*$")`
//! - `x IN (1, 2)` → `In(x, 1, 2)`
//! - `x BETWEEN 1 AND 9` → `(x >= 1 && x <= 9)`
//! - `c ? a : b` → `IfThenElse(c, a, b)`
//! - `xs.length` → `Len(xs)`，`xs.filter(i => i > 1).length` → `Count(xs, "i", i > 1)`

use crate::error::{Result, RuleError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// 规则语言中的输出绑定名
pub const OUTPUT_BINDING: &str = "Result";

/// 表达式方言
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    #[default]
    Relational,
    Script,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// 标识符，可带点号路径，如 `order.amount`
    Ident(String),
    /// 紧跟在 `)` 之后的成员访问，如 `.length`
    Member(String),
    Number(String),
    Str(String),
    Op(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

impl Token {
    fn op(s: &str) -> Self {
        Token::Op(s.to_string())
    }

    fn ident(s: &str) -> Self {
        Token::Ident(s.to_string())
    }

    fn is_op(&self, s: &str) -> bool {
        matches!(self, Token::Op(op) if op == s)
    }

    /// 关键字匹配（大小写不敏感，不含点号）
    fn is_keyword(&self, kw: &str) -> bool {
        matches!(self, Token::Ident(id) if id.eq_ignore_ascii_case(kw))
    }

    fn ends_operand(&self) -> bool {
        matches!(
            self,
            Token::Ident(_) | Token::Number(_) | Token::Str(_) | Token::RParen | Token::RBracket
        )
    }

    fn starts_operand(&self) -> bool {
        matches!(
            self,
            Token::Ident(_) | Token::Number(_) | Token::Str(_) | Token::LParen | Token::LBracket
        ) || self.is_op("!")
            || self.is_op("-")
    }
}

const MULTI_CHAR_OPS: [&str; 10] = ["===", "!==", "==", "!=", "<>", ">=", "<=", "&&", "||", "=>"];
const SINGLE_CHAR_OPS: &str = "><=!+-*/%?:";
const BINARY_OPS: [&str; 12] = ["==", "!=", ">", ">=", "<", "<=", "&&", "||", "+", "*", "/", "%"];

/// 表达式翻译器（无状态）
pub struct Translator;

impl Translator {
    /// 翻译条件表达式
    pub fn translate_condition(text: &str, dialect: Dialect) -> Result<String> {
        Self::translate(text, dialect, true, &BTreeSet::new())
    }

    /// 翻译取值表达式（赋值右侧、公式等）
    pub fn translate_value_expression(text: &str, dialect: Dialect) -> Result<String> {
        Self::translate(text, dialect, false, &BTreeSet::new())
    }

    /// 翻译取值表达式，并把 `locals` 中的名字替换为对应的输出槽位
    ///
    /// 指标规则的公式通过这种方式引用先前赋值的子变量。
    pub fn translate_value_with_locals(
        text: &str,
        dialect: Dialect,
        locals: &BTreeSet<String>,
    ) -> Result<String> {
        Self::translate(text, dialect, false, locals)
    }

    /// 翻译赋值动作：`target = expression;`
    pub fn translate_action(target: &str, expression: &str, dialect: Dialect) -> Result<String> {
        let slot = Self::output_slot(target)?;
        let value = Self::translate_value_expression(expression, dialect)?;
        Ok(format!("{} = {};", slot, value))
    }

    /// 输出路径规范化为索引访问形式
    ///
    /// `discount.rate` → `Result["discount"]["rate"]`，前缀 `result.` 会被去掉。
    pub fn output_slot(target: &str) -> Result<String> {
        let trimmed = target.trim();
        if trimmed.is_empty() {
            return Err(RuleError::parse(target, "输出路径为空"));
        }

        let path = trimmed
            .strip_prefix("result.")
            .or_else(|| trimmed.strip_prefix("Result."))
            .unwrap_or(trimmed);

        let mut slot = OUTPUT_BINDING.to_string();
        for segment in path.split('.') {
            if segment.is_empty()
                || !segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(RuleError::parse(target, format!("非法的输出路径片段 '{}'", segment)));
            }
            slot.push_str(&format!("[\"{}\"]", segment));
        }
        Ok(slot)
    }

    /// JSON 值渲染为规则语言字面量
    pub fn literal(value: &Value) -> String {
        match value {
            Value::Null => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(_) => value.to_string(),
            Value::Array(items) => {
                let rendered: Vec<String> = items.iter().map(Self::literal).collect();
                format!("[{}]", rendered.join(", "))
            }
            // 对象没有对应的字面量，按 JSON 文本传递
            Value::Object(_) => Value::String(value.to_string()).to_string(),
        }
    }

    /// SQL LIKE 模式转换为锚定的正则
    pub fn like_to_regex(pattern: &str) -> String {
        let mut regex = String::from("^");
        let mut buf = [0u8; 4];
        for c in pattern.chars() {
            match c {
                '%' => regex.push_str(".*"),
                '_' => regex.push('.'),
                other => regex.push_str(&regex::escape(other.encode_utf8(&mut buf))),
            }
        }
        regex.push('$');
        regex
    }

    fn translate(
        text: &str,
        dialect: Dialect,
        is_condition: bool,
        locals: &BTreeSet<String>,
    ) -> Result<String> {
        if text.trim().is_empty() {
            return Err(RuleError::parse(text, "表达式为空"));
        }

        let tokens = tokenize(text)?;
        let rewritten = match dialect {
            Dialect::Relational => rewrite_relational(&tokens, text, is_condition)?,
            Dialect::Script => rewrite_script(&tokens, text)?,
        };
        let rewritten = rewrite_ternary(rewritten, text)?;
        let rewritten = substitute_locals(rewritten, locals);

        check_operands(&rewritten, text)?;
        Ok(render(&rewritten))
    }
}

// ==================== 词法分析 ====================

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()))
        {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Number(chars[start..i].iter().collect()));
            continue;
        }

        if is_ident_start(c) {
            let start = i;
            while i < chars.len()
                && (is_ident_char(chars[i])
                    || (chars[i] == '.' && chars.get(i + 1).is_some_and(|n| is_ident_start(*n))))
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        if c == '.' && chars.get(i + 1).is_some_and(|n| is_ident_start(*n)) {
            i += 1;
            let start = i;
            while i < chars.len() && is_ident_char(chars[i]) {
                i += 1;
            }
            tokens.push(Token::Member(chars[start..i].iter().collect()));
            continue;
        }

        if c == '\'' || c == '"' {
            let (content, next) = read_string(&chars, i, text)?;
            tokens.push(Token::Str(content));
            i = next;
            continue;
        }

        match c {
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            '[' => tokens.push(Token::LBracket),
            ']' => tokens.push(Token::RBracket),
            ',' => tokens.push(Token::Comma),
            _ => {
                let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
                if let Some(op) = MULTI_CHAR_OPS.iter().find(|op| rest.starts_with(*op)) {
                    tokens.push(Token::op(op));
                    i += op.len();
                    continue;
                }
                if SINGLE_CHAR_OPS.contains(c) {
                    tokens.push(Token::Op(c.to_string()));
                } else {
                    return Err(RuleError::parse(text, format!("无法识别的字符 '{}'", c)));
                }
            }
        }
        i += 1;
    }

    Ok(tokens)
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn read_string(chars: &[char], start: usize, text: &str) -> Result<(String, usize)> {
    let quote = chars[start];
    let mut content = String::new();
    let mut i = start + 1;

    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                content.push(chars[i + 1]);
                i += 2;
            }
            // SQL 风格的 '' 转义
            c if c == quote && quote == '\'' && chars.get(i + 1) == Some(&'\'') => {
                content.push('\'');
                i += 2;
            }
            c if c == quote => return Ok((content, i + 1)),
            c => {
                content.push(c);
                i += 1;
            }
        }
    }

    Err(RuleError::parse(text, "字符串字面量未闭合"))
}

// ==================== 关系型方言 ====================

fn rewrite_relational(tokens: &[Token], text: &str, is_condition: bool) -> Result<Vec<Token>> {
    let mut out: Vec<Token> = Vec::with_capacity(tokens.len());
    let mut i = 0;

    while i < tokens.len() {
        let token = &tokens[i];

        if token.is_keyword("AND") {
            out.push(Token::op("&&"));
        } else if token.is_keyword("OR") {
            out.push(Token::op("||"));
        } else if token.is_keyword("NOT") {
            let negates_next = tokens.get(i + 1).is_some_and(|t| {
                t.is_keyword("IN") || t.is_keyword("LIKE") || t.is_keyword("BETWEEN")
            });
            if negates_next {
                i += 1;
                i = rewrite_relational_operator(tokens, i, &mut out, true, text)?;
                continue;
            }
            out.push(Token::op("!"));
        } else if token.is_keyword("IN") || token.is_keyword("LIKE") || token.is_keyword("BETWEEN") {
            i = rewrite_relational_operator(tokens, i, &mut out, false, text)?;
            continue;
        } else if token.is_keyword("IS") {
            let mut j = i + 1;
            let negated = tokens.get(j).is_some_and(|t| t.is_keyword("NOT"));
            if negated {
                j += 1;
            }
            if !tokens.get(j).is_some_and(|t| t.is_keyword("NULL")) {
                return Err(RuleError::parse(text, "IS 之后缺少 NULL"));
            }
            out.push(Token::op(if negated { "!=" } else { "==" }));
            out.push(Token::ident("nil"));
            i = j + 1;
            continue;
        } else if token.is_keyword("NULL") {
            out.push(Token::ident("nil"));
        } else if token.is_keyword("TRUE") {
            out.push(Token::ident("true"));
        } else if token.is_keyword("FALSE") {
            out.push(Token::ident("false"));
        } else if token.is_op("=") {
            if !is_condition {
                return Err(RuleError::parse(text, "取值表达式中不允许使用 '='"));
            }
            out.push(Token::op("=="));
        } else if token.is_op("<>") || token.is_op("!==") {
            out.push(Token::op("!="));
        } else if token.is_op("===") {
            out.push(Token::op("=="));
        } else if let Token::Member(name) = token {
            return Err(RuleError::parse(text, format!("关系型方言不支持成员访问 '.{}'", name)));
        } else {
            out.push(token.clone());
        }
        i += 1;
    }

    Ok(out)
}

/// 改写 IN / LIKE / BETWEEN，返回下一个待处理的位置
fn rewrite_relational_operator(
    tokens: &[Token],
    i: usize,
    out: &mut Vec<Token>,
    negated: bool,
    text: &str,
) -> Result<usize> {
    let keyword = &tokens[i];
    let left = pop_arithmetic_operand(out, text)?;
    let mut rewritten = Vec::new();
    let next;

    if keyword.is_keyword("IN") {
        if tokens.get(i + 1) != Some(&Token::LParen) {
            return Err(RuleError::parse(text, "IN 之后缺少括号列表"));
        }
        let close = matching_close(tokens, i + 1, text)?;
        let items = &tokens[i + 2..close];
        if items.is_empty() {
            return Err(RuleError::parse(text, "IN 列表为空"));
        }
        rewritten.push(Token::ident("In"));
        rewritten.push(Token::LParen);
        rewritten.extend(left);
        rewritten.push(Token::Comma);
        rewritten.extend(rewrite_relational(items, text, false)?);
        rewritten.push(Token::RParen);
        next = close + 1;
    } else if keyword.is_keyword("LIKE") {
        let Some(Token::Str(pattern)) = tokens.get(i + 1) else {
            return Err(RuleError::parse(text, "LIKE 之后缺少字符串模式"));
        };
        rewritten.push(Token::ident("Matches"));
        rewritten.push(Token::LParen);
        rewritten.extend(left);
        rewritten.push(Token::Comma);
        rewritten.push(Token::Str(Translator::like_to_regex(pattern)));
        rewritten.push(Token::RParen);
        next = i + 2;
    } else {
        let (low, after_low) = take_arithmetic_operand(tokens, i + 1, text)?;
        if !tokens.get(after_low).is_some_and(|t| t.is_keyword("AND")) {
            return Err(RuleError::parse(text, "BETWEEN 缺少 AND 上界"));
        }
        let (high, after_high) = take_arithmetic_operand(tokens, after_low + 1, text)?;
        let low = rewrite_relational(&low, text, false)?;
        let high = rewrite_relational(&high, text, false)?;

        rewritten.push(Token::LParen);
        rewritten.extend(left.iter().cloned());
        rewritten.push(Token::op(">="));
        rewritten.extend(low);
        rewritten.push(Token::op("&&"));
        rewritten.extend(left);
        rewritten.push(Token::op("<="));
        rewritten.extend(high);
        rewritten.push(Token::RParen);
        next = after_high;
    }

    if negated {
        out.push(Token::op("!"));
    }
    out.extend(rewritten);
    Ok(next)
}

// ==================== 脚本方言 ====================

fn rewrite_script(tokens: &[Token], text: &str) -> Result<Vec<Token>> {
    let mut out: Vec<Token> = Vec::with_capacity(tokens.len());
    let mut i = 0;

    while i < tokens.len() {
        match &tokens[i] {
            Token::Op(op) if op == "===" => out.push(Token::op("==")),
            Token::Op(op) if op == "!==" => out.push(Token::op("!=")),
            Token::Op(op) if op == "=" => {
                return Err(RuleError::parse(text, "表达式中不允许赋值 '='"));
            }
            Token::Ident(id) if id == "null" || id == "undefined" => out.push(Token::ident("nil")),
            Token::Ident(id) if tokens.get(i + 1) == Some(&Token::LParen) => {
                if let Some((receiver, method)) = id.rsplit_once('.') {
                    if let Some(next) =
                        rewrite_method_call(tokens, i, receiver, method, &mut out, text)?
                    {
                        i = next;
                        continue;
                    }
                }
                out.push(tokens[i].clone());
            }
            Token::Ident(id) if id.ends_with(".length") => {
                let receiver = &id[..id.len() - ".length".len()];
                out.extend([
                    Token::ident("Len"),
                    Token::LParen,
                    Token::ident(receiver),
                    Token::RParen,
                ]);
            }
            Token::Member(name) if name == "length" => {
                let operand = pop_operand(&mut out, text)?;
                if operand.first().is_some_and(|t| t.is_keyword("Filter")) {
                    out.push(Token::ident("Count"));
                    out.extend(operand.into_iter().skip(1));
                } else {
                    out.push(Token::ident("Len"));
                    out.push(Token::LParen);
                    out.extend(operand);
                    out.push(Token::RParen);
                }
            }
            Token::Member(name) => {
                return Err(RuleError::parse(text, format!("不支持的成员访问 '.{}'", name)));
            }
            other => out.push(other.clone()),
        }
        i += 1;
    }

    Ok(out)
}

/// 改写集合方法调用；不认识的方法返回 None 原样输出
fn rewrite_method_call(
    tokens: &[Token],
    i: usize,
    receiver: &str,
    method: &str,
    out: &mut Vec<Token>,
    text: &str,
) -> Result<Option<usize>> {
    let open = i + 1;
    let close = matching_close(tokens, open, text)?;
    let args = &tokens[open + 1..close];

    match method {
        "includes" => {
            if args.is_empty() {
                return Err(RuleError::parse(text, "includes() 缺少参数"));
            }
            out.extend([
                Token::ident("Contains"),
                Token::LParen,
                Token::ident(receiver),
                Token::Comma,
            ]);
            out.extend(rewrite_script(args, text)?);
            out.push(Token::RParen);
            Ok(Some(close + 1))
        }
        "filter" | "some" | "every" => {
            let function = match method {
                "filter" => "Filter",
                "some" => "Any",
                _ => "All",
            };
            let (param, body) = match args {
                [Token::Ident(param), arrow, body @ ..] if arrow.is_op("=>") && !body.is_empty() => {
                    (param.clone(), body)
                }
                _ => {
                    return Err(RuleError::parse(
                        text,
                        format!("{}() 需要形如 x => 表达式 的参数", method),
                    ));
                }
            };
            out.extend([
                Token::ident(function),
                Token::LParen,
                Token::ident(receiver),
                Token::Comma,
                Token::Str(param),
                Token::Comma,
            ]);
            out.extend(rewrite_script(body, text)?);
            out.push(Token::RParen);
            Ok(Some(close + 1))
        }
        _ => Ok(None),
    }
}

// ==================== 通用改写 ====================

/// 三元表达式改写为 `IfThenElse(c, a, b)`
///
/// 先递归处理括号内的内容，因此剩下的 `?`/`:` 都在当前层。
fn rewrite_ternary(tokens: Vec<Token>, text: &str) -> Result<Vec<Token>> {
    let mut flat = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i] == Token::LParen {
            let close = matching_close(&tokens, i, text)?;
            flat.push(Token::LParen);
            for (n, arg) in split_top_level(&tokens[i + 1..close]).into_iter().enumerate() {
                if n > 0 {
                    flat.push(Token::Comma);
                }
                flat.extend(rewrite_ternary(arg.to_vec(), text)?);
            }
            flat.push(Token::RParen);
            i = close + 1;
        } else {
            flat.push(tokens[i].clone());
            i += 1;
        }
    }

    let Some(question) = flat.iter().position(|t| t.is_op("?")) else {
        if flat.iter().any(|t| t.is_op(":")) {
            return Err(RuleError::parse(text, "':' 缺少对应的 '?'"));
        }
        return Ok(flat);
    };

    let mut depth = 0;
    let mut colon = None;
    for (offset, token) in flat[question + 1..].iter().enumerate() {
        if token.is_op("?") {
            depth += 1;
        } else if token.is_op(":") {
            if depth == 0 {
                colon = Some(question + 1 + offset);
                break;
            }
            depth -= 1;
        }
    }
    let colon = colon.ok_or_else(|| RuleError::parse(text, "三元表达式缺少 ':'"))?;

    let cond = &flat[..question];
    let then = &flat[question + 1..colon];
    let otherwise = &flat[colon + 1..];
    if cond.is_empty() || then.is_empty() || otherwise.is_empty() {
        return Err(RuleError::parse(text, "三元表达式缺少操作数"));
    }

    let mut out = vec![Token::ident("IfThenElse"), Token::LParen];
    out.extend(cond.iter().cloned());
    out.push(Token::Comma);
    out.extend(rewrite_ternary(then.to_vec(), text)?);
    out.push(Token::Comma);
    out.extend(rewrite_ternary(otherwise.to_vec(), text)?);
    out.push(Token::RParen);
    Ok(out)
}

fn substitute_locals(tokens: Vec<Token>, locals: &BTreeSet<String>) -> Vec<Token> {
    if locals.is_empty() {
        return tokens;
    }
    let mut out = Vec::with_capacity(tokens.len());
    for token in tokens {
        match token {
            Token::Ident(id) if locals.contains(&id) => {
                out.extend([
                    Token::ident(OUTPUT_BINDING),
                    Token::LBracket,
                    Token::Str(id),
                    Token::RBracket,
                ]);
            }
            other => out.push(other),
        }
    }
    out
}

/// 校验每个运算符两侧都有操作数
fn check_operands(tokens: &[Token], text: &str) -> Result<()> {
    let mut depth: i32 = 0;
    for (i, token) in tokens.iter().enumerate() {
        let prev = if i > 0 { tokens.get(i - 1) } else { None };
        let next = tokens.get(i + 1);

        match token {
            Token::LParen | Token::LBracket => depth += 1,
            Token::RParen | Token::RBracket => {
                depth -= 1;
                if depth < 0 {
                    return Err(RuleError::parse(text, "括号不匹配"));
                }
            }
            Token::Op(op) => {
                let binary = BINARY_OPS.contains(&op.as_str())
                    || (op == "-" && prev.is_some_and(Token::ends_operand));
                if binary {
                    if !prev.is_some_and(Token::ends_operand) {
                        return Err(RuleError::parse(text, format!("运算符 '{}' 缺少左操作数", op)));
                    }
                    if !next.is_some_and(Token::starts_operand) {
                        return Err(RuleError::parse(text, format!("运算符 '{}' 缺少右操作数", op)));
                    }
                } else if op == "!" || op == "-" {
                    if !next.is_some_and(Token::starts_operand) {
                        return Err(RuleError::parse(text, format!("运算符 '{}' 缺少操作数", op)));
                    }
                } else {
                    return Err(RuleError::parse(text, format!("不支持的运算符 '{}'", op)));
                }
            }
            Token::Comma if depth == 0 => {
                return Err(RuleError::parse(text, "括号外出现逗号"));
            }
            _ => {}
        }
    }

    if depth != 0 {
        return Err(RuleError::parse(text, "括号不匹配"));
    }
    Ok(())
}

/// 从已输出的 token 末尾取出一个完整操作数
fn pop_operand(out: &mut Vec<Token>, text: &str) -> Result<Vec<Token>> {
    let Some(last) = out.last() else {
        return Err(RuleError::parse(text, "缺少左操作数"));
    };

    let start = match last {
        Token::Ident(_) | Token::Number(_) | Token::Str(_) => out.len() - 1,
        Token::RParen | Token::RBracket => {
            let mut depth = 0;
            let mut open = None;
            for idx in (0..out.len()).rev() {
                match out[idx] {
                    Token::RParen | Token::RBracket => depth += 1,
                    Token::LParen | Token::LBracket => {
                        depth -= 1;
                        if depth == 0 {
                            open = Some(idx);
                            break;
                        }
                    }
                    _ => {}
                }
            }
            let open = open.ok_or_else(|| RuleError::parse(text, "括号不匹配"))?;
            // 函数调用连同函数名一起取出
            if open > 0 && matches!(out[open - 1], Token::Ident(_)) {
                open - 1
            } else {
                open
            }
        }
        _ => return Err(RuleError::parse(text, "缺少左操作数")),
    };

    Ok(out.split_off(start))
}

fn is_arithmetic(token: &Token) -> bool {
    matches!(token, Token::Op(op) if matches!(op.as_str(), "+" | "-" | "*" | "/" | "%"))
}

/// 从已输出的 token 末尾取出完整的算术表达式，遇到比较或逻辑运算符停止
fn pop_arithmetic_operand(out: &mut Vec<Token>, text: &str) -> Result<Vec<Token>> {
    let mut operand = pop_operand(out, text)?;
    while out.last().is_some_and(is_arithmetic) {
        let binary = out.len() >= 2 && out[out.len() - 2].ends_operand();
        let Some(op) = out.pop() else { break };
        if !binary {
            if !op.is_op("-") {
                return Err(RuleError::parse(text, "算术运算符缺少左操作数"));
            }
            operand.insert(0, op);
            break;
        }
        let mut lhs = pop_operand(out, text)?;
        lhs.push(op);
        lhs.extend(operand);
        operand = lhs;
    }
    Ok(operand)
}

/// 从输入中读取完整的算术表达式，遇到 AND 或比较运算符停止
fn take_arithmetic_operand(
    tokens: &[Token],
    start: usize,
    text: &str,
) -> Result<(Vec<Token>, usize)> {
    let (mut operand, mut next) = take_operand(tokens, start, text)?;
    while let Some(op) = tokens.get(next).filter(|t| is_arithmetic(t)) {
        let (rhs, after) = take_operand(tokens, next + 1, text)?;
        operand.push(op.clone());
        operand.extend(rhs);
        next = after;
    }
    Ok((operand, next))
}

/// 从输入中读取一个操作数（可带负号、函数调用或括号组）
fn take_operand(tokens: &[Token], start: usize, text: &str) -> Result<(Vec<Token>, usize)> {
    let mut i = start;
    let mut operand = Vec::new();
    if tokens.get(i).is_some_and(|t| t.is_op("-")) {
        operand.push(Token::op("-"));
        i += 1;
    }

    match tokens.get(i) {
        Some(Token::Ident(_)) if tokens.get(i + 1) == Some(&Token::LParen) => {
            let close = matching_close(tokens, i + 1, text)?;
            operand.extend(tokens[i..=close].iter().cloned());
            Ok((operand, close + 1))
        }
        Some(Token::LParen) => {
            let close = matching_close(tokens, i, text)?;
            operand.extend(tokens[i..=close].iter().cloned());
            Ok((operand, close + 1))
        }
        Some(token @ (Token::Ident(_) | Token::Number(_) | Token::Str(_)))
            if !token.is_keyword("AND") =>
        {
            operand.push(token.clone());
            Ok((operand, i + 1))
        }
        _ => Err(RuleError::parse(text, "缺少操作数")),
    }
}

fn matching_close(tokens: &[Token], open: usize, text: &str) -> Result<usize> {
    let mut depth = 0;
    for (idx, token) in tokens.iter().enumerate().skip(open) {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => {
                depth -= 1;
                if depth == 0 {
                    return Ok(idx);
                }
            }
            _ => {}
        }
    }
    Err(RuleError::parse(text, "括号不匹配"))
}

fn split_top_level(tokens: &[Token]) -> Vec<&[Token]> {
    let mut parts = Vec::new();
    let mut depth = 0;
    let mut start = 0;
    for (idx, token) in tokens.iter().enumerate() {
        match token {
            Token::LParen | Token::LBracket => depth += 1,
            Token::RParen | Token::RBracket => depth -= 1,
            Token::Comma if depth == 0 => {
                parts.push(&tokens[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&tokens[start..]);
    parts
}

fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    let mut prev: Option<&Token> = None;

    for (i, token) in tokens.iter().enumerate() {
        let glue = match (prev, token) {
            (None, _) => true,
            (Some(Token::LParen | Token::LBracket), _) => true,
            (_, Token::RParen | Token::RBracket | Token::Comma) => true,
            (Some(Token::Ident(_)), Token::LParen) => true,
            (Some(Token::Ident(_) | Token::RBracket), Token::LBracket) => true,
            // 一元运算符紧贴操作数
            (Some(Token::Op(op)), _) if (op == "!" || op == "-") && is_unary(tokens, i - 1) => {
                true
            }
            _ => false,
        };
        if !glue {
            out.push(' ');
        }

        match token {
            Token::Ident(s) | Token::Number(s) | Token::Op(s) => out.push_str(s),
            Token::Member(s) => {
                out.push('.');
                out.push_str(s);
            }
            Token::Str(s) => out.push_str(&Value::String(s.clone()).to_string()),
            Token::LParen => out.push('('),
            Token::RParen => out.push(')'),
            Token::LBracket => out.push('['),
            Token::RBracket => out.push(']'),
            Token::Comma => out.push(','),
        }
        prev = Some(token);
    }

    out
}

fn is_unary(tokens: &[Token], idx: usize) -> bool {
    idx == 0 || !tokens[idx - 1].ends_operand()
}
