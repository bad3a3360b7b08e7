//! 步骤条件：Always / OnSuccess / OnFailure / Custom(SafeExpr)
//!
//! 规划器给出的条件文本格式松散，ConditionParser 依次尝试：
//! 1. 关键字（always / on_success / on_failure，裸 on_* 绑定到最后一个依赖）
//! 2. 点号模式 `<stepId>.success|failure`（以及 `on_success(<stepId>)`）
//! 3. 受限表达式：字面量、步骤路径、比较、与或非、括号、白名单函数 len/length/exists/contains
//!
//! 无法解析的文本降级为 Always 并记录警告；表达式只在校验时解析一次，执行时只求值。

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Serialize, Serializer};
use serde_json::Value;

/// 表达式最大嵌套深度
const MAX_DEPTH: usize = 32;

/// 步骤视图的顶层字段；success / failure 及其别名是布尔简写
const VIEW_FIELDS: &[&str] = &[
    "status",
    "output",
    "error",
    "confidence",
    "attempts",
    "success",
    "succeeded",
    "failure",
    "failed",
];

/// 条件求值时查看其它步骤结果的接口
///
/// 返回步骤的 JSON 视图：`{"status": "completed", "output": ..., "error": ..., "success": true, ...}`；步骤不存在时返回 None。
pub trait StepView {
    fn step_view(&self, step_id: &str) -> Option<Value>;
}

/// 步骤条件
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Condition {
    #[default]
    Always,
    OnSuccess(String),
    OnFailure(String),
    Custom(SafeExpr),
}

impl Condition {
    /// 条件中引用到的步骤
    pub fn referenced_steps(&self) -> BTreeSet<String> {
        match self {
            Condition::Always => BTreeSet::new(),
            Condition::OnSuccess(id) | Condition::OnFailure(id) => BTreeSet::from([id.clone()]),
            Condition::Custom(expr) => expr.referenced_steps(),
        }
    }

    /// 在已终结的依赖结果上求值
    pub fn evaluate(&self, view: &dyn StepView) -> bool {
        let status_of = |id: &str| {
            view.step_view(id)
                .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(String::from))
        };
        match self {
            Condition::Always => true,
            Condition::OnSuccess(id) => status_of(id).as_deref() == Some("completed"),
            Condition::OnFailure(id) => status_of(id).as_deref() == Some("failed"),
            Condition::Custom(expr) => expr.evaluate(view),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Always => write!(f, "always"),
            Condition::OnSuccess(id) => write!(f, "on_success({id})"),
            Condition::OnFailure(id) => write!(f, "on_failure({id})"),
            Condition::Custom(expr) => write!(f, "custom({})", expr.source()),
        }
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

/// 条件解析器（无状态）
pub struct ConditionParser;

static DOTTED_RE: OnceLock<Regex> = OnceLock::new();
static CALL_RE: OnceLock<Regex> = OnceLock::new();

fn dotted_pattern() -> &'static Regex {
    DOTTED_RE.get_or_init(|| {
        Regex::new(r"(?i)^([A-Za-z_][A-Za-z0-9_\-]*)\.(success|succeeded|failure|failed)$").unwrap()
    })
}

fn call_pattern() -> &'static Regex {
    CALL_RE.get_or_init(|| {
        Regex::new(r"(?i)^on_(success|failure)\s*[(:]\s*([A-Za-z_][A-Za-z0-9_\-]*)\s*\)?$").unwrap()
    })
}

impl ConditionParser {
    /// 解析条件文本；dependencies 为该步骤声明的依赖（用于绑定裸 on_success / on_failure）
    ///
    /// 总是返回一个条件，从不报错。
    pub fn parse(text: &str, dependencies: &[String]) -> Condition {
        let trimmed = text.trim();
        let lower = trimmed.to_lowercase();

        match lower.as_str() {
            "" | "always" | "none" | "true" => return Condition::Always,
            "on_success" | "on_failure" => {
                return match dependencies.last() {
                    Some(dep) if lower == "on_success" => Condition::OnSuccess(dep.clone()),
                    Some(dep) => Condition::OnFailure(dep.clone()),
                    None => {
                        tracing::warn!(condition = %trimmed, "bare condition without dependencies, using always");
                        Condition::Always
                    }
                };
            }
            _ => {}
        }

        if let Some(caps) = dotted_pattern().captures(trimmed) {
            let id = caps[1].to_string();
            return match caps[2].to_ascii_lowercase().as_str() {
                "success" | "succeeded" => Condition::OnSuccess(id),
                _ => Condition::OnFailure(id),
            };
        }
        if let Some(caps) = call_pattern().captures(trimmed) {
            let id = caps[2].to_string();
            return match caps[1].to_ascii_lowercase().as_str() {
                "success" => Condition::OnSuccess(id),
                _ => Condition::OnFailure(id),
            };
        }

        match SafeExpr::parse(trimmed) {
            Ok(expr) => Condition::Custom(expr),
            Err(e) => {
                tracing::warn!(condition = %trimmed, error = %e, "unparseable condition, using always");
                Condition::Always
            }
        }
    }
}

/// 受限表达式：只含字面量、步骤路径、比较、逻辑运算与白名单函数
#[derive(Debug, Clone, PartialEq)]
pub struct SafeExpr {
    source: String,
    expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path { step: String, segments: Vec<Segment> },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    Call(Func, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Func {
    Len,
    Exists,
    Contains,
}

impl Func {
    fn lookup(name: &str) -> Option<(Func, usize)> {
        match name.to_ascii_lowercase().as_str() {
            "len" | "length" => Some((Func::Len, 1)),
            "exists" => Some((Func::Exists, 1)),
            "contains" => Some((Func::Contains, 2)),
            _ => None,
        }
    }
}

impl SafeExpr {
    pub fn parse(text: &str) -> Result<Self, String> {
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Err("empty expression".to_string());
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or_expr(0)?;
        if parser.pos != parser.tokens.len() {
            return Err(format!("unexpected token {:?}", parser.tokens[parser.pos]));
        }
        Ok(Self {
            source: text.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn referenced_steps(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        collect_steps(&self.expr, &mut out);
        out
    }

    /// 按真值语义求值：null / false / 0 / 空串 / 空集合为假
    pub fn evaluate(&self, view: &dyn StepView) -> bool {
        truthy(&eval(&self.expr, view))
    }
}

impl Serialize for SafeExpr {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.source)
    }
}

fn collect_steps(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Path { step, .. } => {
            out.insert(step.clone());
        }
        Expr::Not(e) => collect_steps(e, out),
        Expr::And(a, b) | Expr::Or(a, b) | Expr::Compare(a, _, b) => {
            collect_steps(a, out);
            collect_steps(b, out);
        }
        Expr::Call(_, args) => args.iter().for_each(|a| collect_steps(a, out)),
    }
}

// ---------- 词法 ----------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Cmp(CmpOp),
    And,
    Or,
    Not,
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(format!("unexpected '{c}'"));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '=' | '!' | '<' | '>' => {
                let next_eq = chars.get(i + 1) == Some(&'=');
                let (tok, len) = match (c, next_eq) {
                    ('=', true) => (Token::Cmp(CmpOp::Eq), 2),
                    ('=', false) => (Token::Cmp(CmpOp::Eq), 1),
                    ('!', true) => (Token::Cmp(CmpOp::Ne), 2),
                    ('!', false) => (Token::Not, 1),
                    ('<', true) => (Token::Cmp(CmpOp::Le), 2),
                    ('<', false) => (Token::Cmp(CmpOp::Lt), 1),
                    ('>', true) => (Token::Cmp(CmpOp::Ge), 2),
                    _ => (Token::Cmp(CmpOp::Gt), 1),
                };
                tokens.push(tok);
                i += len;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string".to_string()),
                        Some('\\') => {
                            if let Some(&escaped) = chars.get(i + 1) {
                                s.push(escaped);
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                // 小数点后必须是数字，否则 `.` 属于路径
                if chars.get(i) == Some(&'.') && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) {
                    // 路径中的数字下标（如 s1.output.0.text）不取小数
                    let after_dot = matches!(tokens.last(), Some(Token::Dot));
                    if !after_dot {
                        i += 1;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let raw: String = chars[start..i].iter().collect();
                let n = raw
                    .parse::<f64>()
                    .map_err(|_| format!("bad number '{raw}'"))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '-')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

// ---------- 语法 ----------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, want: Token) -> Result<(), String> {
        match self.next() {
            Some(tok) if tok == want => Ok(()),
            other => Err(format!("expected {want:?}, found {other:?}")),
        }
    }

    fn or_expr(&mut self, depth: usize) -> Result<Expr, String> {
        if depth > MAX_DEPTH {
            return Err("expression nested too deeply".to_string());
        }
        let mut left = self.and_expr(depth)?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and_expr(depth)?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self, depth: usize) -> Result<Expr, String> {
        let mut left = self.not_expr(depth)?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.not_expr(depth)?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self, depth: usize) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            if depth > MAX_DEPTH {
                return Err("expression nested too deeply".to_string());
            }
            return Ok(Expr::Not(Box::new(self.not_expr(depth + 1)?)));
        }
        self.compare(depth)
    }

    fn compare(&mut self, depth: usize) -> Result<Expr, String> {
        let left = self.primary(depth)?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.primary(depth)?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn primary(&mut self, depth: usize) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let inner = self.or_expr(depth + 1)?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(word)) => {
                let literal = match word.to_ascii_lowercase().as_str() {
                    "true" => Some(Value::Bool(true)),
                    "false" => Some(Value::Bool(false)),
                    "null" | "none" => Some(Value::Null),
                    _ => None,
                };
                if let Some(v) = literal {
                    Ok(Expr::Literal(v))
                } else if self.peek() == Some(&Token::LParen) {
                    self.call(&word, depth)
                } else {
                    self.path(word)
                }
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }

    fn call(&mut self, name: &str, depth: usize) -> Result<Expr, String> {
        let (func, arity) =
            Func::lookup(name).ok_or_else(|| format!("function '{name}' is not allowed"))?;
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.or_expr(depth + 1)?);
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        if args.len() != arity {
            return Err(format!("{name}() takes {arity} argument(s), got {}", args.len()));
        }
        Ok(Expr::Call(func, args))
    }

    /// 步骤路径至少要有一段字段访问，裸标识符不被接受；首段必须是步骤视图里的字段
    fn path(&mut self, step: String) -> Result<Expr, String> {
        let mut segments = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(key)) => segments.push(Segment::Key(key)),
                        Some(Token::Num(n)) if n >= 0.0 && n.fract() == 0.0 => {
                            segments.push(Segment::Index(n as usize))
                        }
                        other => return Err(format!("bad path segment {other:?}")),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Num(n)) if n >= 0.0 && n.fract() == 0.0 => {
                            segments.push(Segment::Index(n as usize))
                        }
                        Some(Token::Str(key)) => segments.push(Segment::Key(key)),
                        other => return Err(format!("bad index {other:?}")),
                    }
                    self.expect(Token::RBracket)?;
                }
                _ => break,
            }
        }
        match segments.first_mut() {
            None => return Err(format!("unknown identifier '{step}'")),
            Some(Segment::Key(field)) => {
                let lower = field.to_ascii_lowercase();
                if !VIEW_FIELDS.contains(&lower.as_str()) {
                    return Err(format!("unknown field '{field}' on step '{step}'"));
                }
                *field = lower;
            }
            Some(Segment::Index(_)) => {
                return Err(format!("step '{step}' cannot be indexed directly"))
            }
        }
        Ok(Expr::Path { step, segments })
    }
}

// ---------- 求值 ----------

fn eval(expr: &Expr, view: &dyn StepView) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Path { step, segments } => {
            let mut current = view.step_view(step).unwrap_or(Value::Null);
            for seg in segments {
                current = match (seg, current) {
                    (Segment::Key(k), Value::Object(mut map)) => map.remove(k).unwrap_or(Value::Null),
                    (Segment::Key(k), Value::Array(mut items)) => match k.parse::<usize>() {
                        Ok(i) if i < items.len() => items.swap_remove(i),
                        _ => Value::Null,
                    },
                    (Segment::Index(i), Value::Array(mut items)) if *i < items.len() => {
                        items.swap_remove(*i)
                    }
                    _ => Value::Null,
                };
            }
            current
        }
        Expr::Not(e) => Value::Bool(!truthy(&eval(e, view))),
        Expr::And(a, b) => Value::Bool(truthy(&eval(a, view)) && truthy(&eval(b, view))),
        Expr::Or(a, b) => Value::Bool(truthy(&eval(a, view)) || truthy(&eval(b, view))),
        Expr::Compare(a, op, b) => Value::Bool(compare(&eval(a, view), *op, &eval(b, view))),
        Expr::Call(func, args) => {
            let values: Vec<Value> = args.iter().map(|a| eval(a, view)).collect();
            call_func(*func, &values)
        }
    }
}

fn call_func(func: Func, args: &[Value]) -> Value {
    match (func, args) {
        (Func::Len, [v]) => Value::from(length(v)),
        (Func::Exists, [v]) => Value::Bool(!v.is_null()),
        (Func::Contains, [haystack, needle]) => Value::Bool(match haystack {
            Value::Array(items) => items.iter().any(|i| loose_eq(i, needle)),
            Value::String(s) => match needle {
                Value::String(n) => s.contains(n.as_str()),
                other => s.contains(&other.to_string()),
            },
            Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
            _ => false,
        }),
        _ => Value::Null,
    }
}

fn length(v: &Value) -> usize {
    match v {
        Value::String(s) => s.chars().count(),
        Value::Array(a) => a.len(),
        Value::Object(m) => m.len(),
        _ => 0,
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(m) => !m.is_empty(),
    }
}

/// 数字按数值比较（1 == 1.0），其余按 JSON 结构相等
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, op: CmpOp, b: &Value) -> bool {
    match op {
        CmpOp::Eq => return loose_eq(a, b),
        CmpOp::Ne => return !loose_eq(a, b),
        _ => {}
    }
    let ordering = match (a, b) {
        (Value::Number(_), Value::Number(_)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    };
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        CmpOp::Lt => ordering.is_lt(),
        CmpOp::Le => ordering.is_le(),
        CmpOp::Gt => ordering.is_gt(),
        CmpOp::Ge => ordering.is_ge(),
        CmpOp::Eq | CmpOp::Ne => false,
    }
}
