//! 计划数据模型：Plan / Step / ParamValue / StepOutputRef 与规划上下文

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::planning::Condition;
use crate::tools::ToolCategory;

/// 对其它步骤输出的引用：`<stepId>.output[.<key>|.<index>]*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutputRef {
    pub step_id: String,
    /// 在输出上逐层取值的路径；对象按键取，数组按下标取
    pub path: Vec<String>,
}

static REF_RE: OnceLock<Regex> = OnceLock::new();

impl StepOutputRef {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            path: Vec::new(),
        }
    }

    pub fn with_path<I, S>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.path = path.into_iter().map(Into::into).collect();
        self
    }

    /// 按占位符语法解析；不匹配时返回 None
    pub fn parse(text: &str) -> Option<Self> {
        let re = REF_RE.get_or_init(|| {
            Regex::new(r"^([A-Za-z_][A-Za-z0-9_\-]*)\.output((?:\.[A-Za-z0-9_\-]+)*)$").unwrap()
        });
        let caps = re.captures(text.trim())?;
        let path = caps[2]
            .split('.')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        Some(Self {
            step_id: caps[1].to_string(),
            path,
        })
    }

    /// 在步骤输出上取路径对应的值；路径不存在返回 None
    pub fn select<'a>(&self, output: &'a Value) -> Option<&'a Value> {
        let mut current = output;
        for seg in &self.path {
            current = match current {
                Value::Object(map) => map.get(seg)?,
                Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl fmt::Display for StepOutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.output", self.step_id)?;
        for seg in &self.path {
            write!(f, ".{seg}")?;
        }
        Ok(())
    }
}

/// 步骤参数值：字面量，或（嵌套在列表 / 对象中的）输出引用
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Literal(Value),
    Ref(StepOutputRef),
    List(Vec<ParamValue>),
    Object(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    /// 以规划器输出格式还原为 JSON（引用写作 `{"$ref": "..."}`）
    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::Literal(v) => v.clone(),
            ParamValue::Ref(r) => serde_json::json!({ "$ref": r.to_string() }),
            ParamValue::List(items) => Value::Array(items.iter().map(ParamValue::to_json).collect()),
            ParamValue::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// 收集其中所有引用
    pub fn refs(&self) -> Vec<&StepOutputRef> {
        match self {
            ParamValue::Literal(_) => Vec::new(),
            ParamValue::Ref(r) => vec![r],
            ParamValue::List(items) => items.iter().flat_map(ParamValue::refs).collect(),
            ParamValue::Object(map) => map.values().flat_map(ParamValue::refs).collect(),
        }
    }
}

impl Serialize for ParamValue {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(s)
    }
}

/// 计划中的一个步骤
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub id: String,
    pub tool: String,
    pub params: BTreeMap<String, ParamValue>,
    pub dependencies: Vec<String>,
    pub condition: Condition,
    #[serde(rename = "estimated_duration_ms", serialize_with = "ser_ms")]
    pub estimated_duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn ser_ms<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl Step {
    pub fn new(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            params: BTreeMap::new(),
            dependencies: Vec::new(),
            condition: Condition::Always,
            estimated_duration: Duration::from_secs(5),
            description: None,
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        let id = step_id.into();
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub fn estimated_duration(mut self, d: Duration) -> Self {
        self.estimated_duration = d;
        self
    }
}

/// 计划来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStrategy {
    /// LLM 生成并通过校验（可能经过确定性修复）
    Llm,
    /// LLM 计划不可用，按查询类型选出的单步回退计划
    Fallback,
}

/// 校验通过的执行计划（步骤构成 DAG）
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: String,
    pub query: String,
    pub session_id: String,
    pub query_type: QueryType,
    pub strategy: PlanStrategy,
    /// 校验失败后重新提示的次数
    pub replans: usize,
    pub created_at: DateTime<Utc>,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(ctx: &PlanningContext, strategy: PlanStrategy, steps: Vec<Step>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            query: ctx.query.clone(),
            session_id: ctx.session_id.clone(),
            query_type: ctx.query_type,
            strategy,
            replans: 0,
            created_at: Utc::now(),
            steps,
        }
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// 查询类型：决定期望的工具类别与回退计划
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Lookup,
    DocumentAnalysis,
    Comparison,
    Computation,
    Visualization,
    Status,
}

impl QueryType {
    /// 该类查询优先使用的工具类别（按优先级）
    pub fn preferred_categories(self) -> &'static [ToolCategory] {
        match self {
            QueryType::Lookup => &[ToolCategory::Search],
            QueryType::DocumentAnalysis => &[ToolCategory::Analytics, ToolCategory::Search],
            QueryType::Comparison => &[ToolCategory::Analytics, ToolCategory::Synthesis],
            QueryType::Computation => &[ToolCategory::Computation],
            QueryType::Visualization => &[ToolCategory::Visualization],
            QueryType::Status => &[ToolCategory::Utility],
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryType::Lookup => "lookup",
            QueryType::DocumentAnalysis => "document_analysis",
            QueryType::Comparison => "comparison",
            QueryType::Computation => "computation",
            QueryType::Visualization => "visualization",
            QueryType::Status => "status",
        };
        f.write_str(s)
    }
}

/// 对话中的一轮
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// 规划上下文
#[derive(Debug, Clone, Serialize)]
pub struct PlanningContext {
    pub query: String,
    pub session_id: String,
    pub active_documents: Vec<String>,
    pub history: Vec<ConversationTurn>,
    /// 规划时注册表中的工具名快照
    pub available_tools: Vec<String>,
    pub query_type: QueryType,
}

impl PlanningContext {
    /// 仅有查询与会话的最小上下文，按查询文本分类
    pub fn new(query: impl Into<String>, session_id: impl Into<String>) -> Self {
        let query = query.into();
        let query_type = super::QueryClassifier::classify(&query, 0);
        Self {
            query,
            session_id: session_id.into(),
            active_documents: Vec::new(),
            history: Vec::new(),
            available_tools: Vec::new(),
            query_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_ref_grammar() {
        let r = StepOutputRef::parse("s1.output").unwrap();
        assert_eq!(r, StepOutputRef::new("s1"));
        let r = StepOutputRef::parse("search_1.output.hits.0.text").unwrap();
        assert_eq!(r.step_id, "search_1");
        assert_eq!(r.path, vec!["hits", "0", "text"]);
        assert_eq!(r.to_string(), "search_1.output.hits.0.text");

        assert!(StepOutputRef::parse("s1").is_none());
        assert!(StepOutputRef::parse("s1.result").is_none());
        assert!(StepOutputRef::parse("{{s1.output}}").is_none());
    }

    #[test]
    fn test_select_path() {
        let out = json!({"hits": [{"text": "a"}, {"text": "b"}]});
        let r = StepOutputRef::new("s1").with_path(["hits", "1", "text"]);
        assert_eq!(r.select(&out), Some(&json!("b")));
        let r = StepOutputRef::new("s1").with_path(["hits", "9"]);
        assert_eq!(r.select(&out), None);
        assert_eq!(StepOutputRef::new("s1").select(&out), Some(&out));
    }

    #[test]
    fn test_param_value_json_form() {
        let v = ParamValue::List(vec![
            ParamValue::Literal(json!("a.pdf")),
            ParamValue::Ref(StepOutputRef::new("s1")),
        ]);
        assert_eq!(v.to_json(), json!(["a.pdf", {"$ref": "s1.output"}]));
        assert_eq!(v.refs().len(), 1);
    }
}
