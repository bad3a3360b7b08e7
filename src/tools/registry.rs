//! 工具注册表
//!
//! 所有工具实现 Tool trait（异步 execute，参数与返回值均为 JSON 树），注册时附带不可变的 ToolMetadata
//! （描述、类别、可靠性等级、预估耗时、参数 schema）。注册只在启动阶段进行，之后以 Arc 共享、只读并发访问。

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;

/// 工具 trait：按命名参数（JSON 对象）执行，返回可序列化为 map/list/string/number 的 JSON 值
#[async_trait]
pub trait Tool: Send + Sync {
    async fn execute(&self, args: Value) -> Result<Value, String>;
}

/// 工具类别（供规划器按查询类型挑选）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Search,
    Synthesis,
    Analytics,
    Visualization,
    Computation,
    Utility,
}

/// 可靠性等级：决定重试预算与置信度基数
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    High,
    Medium,
    Low,
}

impl Reliability {
    /// 失败后允许的重试次数
    pub fn max_retries(self) -> u32 {
        match self {
            Reliability::High => 1,
            Reliability::Medium => 2,
            Reliability::Low => 3,
        }
    }

    /// 置信度基数
    pub fn base_score(self) -> f64 {
        match self {
            Reliability::High => 0.95,
            Reliability::Medium => 0.85,
            Reliability::Low => 0.70,
        }
    }
}

/// 参数期望的形状
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParamShape {
    String,
    Number,
    Boolean,
    Sequence,
    Mapping,
    #[default]
    Any,
}

impl ParamShape {
    /// 与形状匹配的「空值」；依赖被跳过或失败时用它代替 null
    pub fn empty_value(self) -> Value {
        match self {
            ParamShape::String | ParamShape::Any => Value::String(String::new()),
            ParamShape::Number => Value::from(0),
            ParamShape::Boolean => Value::Bool(false),
            ParamShape::Sequence => Value::Array(Vec::new()),
            ParamShape::Mapping => Value::Object(serde_json::Map::new()),
        }
    }

    pub fn matches(self, value: &Value) -> bool {
        match self {
            ParamShape::String => value.is_string(),
            ParamShape::Number => value.is_number(),
            ParamShape::Boolean => value.is_boolean(),
            ParamShape::Sequence => value.is_array(),
            ParamShape::Mapping => value.is_object(),
            ParamShape::Any => !value.is_null(),
        }
    }

    /// 将值按形状做保守转换；已匹配的值原样返回
    pub fn coerce(self, value: Value) -> Value {
        if self.matches(&value) {
            return value;
        }
        match (self, value) {
            (_, Value::Null) => self.empty_value(),
            (ParamShape::Sequence, other) => Value::Array(vec![other]),
            (ParamShape::String, other) => Value::String(other.to_string()),
            (ParamShape::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::String(s)),
            (ParamShape::Boolean, Value::String(s)) => {
                let flag = s.trim().parse::<bool>().ok();
                flag.map(Value::Bool).unwrap_or(Value::String(s))
            }
            (_, other) => other,
        }
    }
}

/// 单个参数的声明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub shape: ParamShape,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, shape: ParamShape) -> Self {
        Self {
            name: name.into(),
            required: true,
            shape,
        }
    }

    pub fn optional(name: impl Into<String>, shape: ParamShape) -> Self {
        Self {
            name: name.into(),
            required: false,
            shape,
        }
    }
}

/// 工具元数据（注册后不可变）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolMetadata {
    pub description: String,
    pub category: ToolCategory,
    pub reliability: Reliability,
    #[serde(with = "duration_ms")]
    pub estimated_duration: Duration,
    pub parameters: Vec<ParamSpec>,
    /// 输出形状：步骤被跳过时按它给出空值
    pub output_shape: ParamShape,
}

impl ToolMetadata {
    pub fn new(description: impl Into<String>, category: ToolCategory) -> Self {
        Self {
            description: description.into(),
            category,
            reliability: Reliability::Medium,
            estimated_duration: Duration::from_secs(5),
            parameters: Vec::new(),
            output_shape: ParamShape::Any,
        }
    }

    pub fn reliability(mut self, reliability: Reliability) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn estimated_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration = duration;
        self
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    pub fn output_shape(mut self, shape: ParamShape) -> Self {
        self.output_shape = shape;
        self
    }

    pub fn param_spec(&self, name: &str) -> Option<&ParamSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// 参数的声明形状；未声明的参数视为 Any
    pub fn param_shape(&self, name: &str) -> ParamShape {
        self.param_spec(name).map(|p| p.shape).unwrap_or_default()
    }

    pub fn required_params(&self) -> impl Iterator<Item = &ParamSpec> {
        self.parameters.iter().filter(|p| p.required)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// 已注册的工具：名称 + 可调用对象 + 元数据
#[derive(Clone)]
pub struct RegisteredTool {
    pub name: String,
    pub tool: Arc<dyn Tool>,
    pub metadata: ToolMetadata,
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("name", &self.name)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// 注册表统计，供规划器自省
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub by_category: BTreeMap<ToolCategory, usize>,
    pub by_reliability: BTreeMap<Reliability, usize>,
}

/// 工具注册表：按注册顺序保存，按名索引
#[derive(Default)]
pub struct ToolRegistry {
    entries: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名已存在时返回 DuplicateTool
    pub fn register(
        &mut self,
        name: impl Into<String>,
        tool: Arc<dyn Tool>,
        metadata: ToolMetadata,
    ) -> Result<(), AgentError> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(AgentError::DuplicateTool(name));
        }
        tracing::debug!(tool = %name, category = ?metadata.category, "tool registered");
        self.index.insert(name.clone(), self.entries.len());
        self.entries.push(RegisteredTool {
            name,
            tool,
            metadata,
        });
        Ok(())
    }

    /// 按名查找；不存在时返回 ToolNotFound
    pub fn lookup(&self, name: &str) -> Result<&RegisteredTool, AgentError> {
        self.index
            .get(name)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// 指定类别的工具，按注册顺序返回
    pub fn list_by_category(&self, category: ToolCategory) -> Vec<&RegisteredTool> {
        self.entries
            .iter()
            .filter(|t| t.metadata.category == category)
            .collect()
    }

    pub fn tools(&self) -> &[RegisteredTool] {
        &self.entries
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.entries.iter().map(|t| t.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total: self.entries.len(),
            ..Default::default()
        };
        for entry in &self.entries {
            *stats.by_category.entry(entry.metadata.category).or_insert(0) += 1;
            *stats
                .by_reliability
                .entry(entry.metadata.reliability)
                .or_insert(0) += 1;
        }
        stats
    }

    /// 动态生成工具清单 JSON（名称、描述、类别、参数 schema），拼入规划提示词
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .entries
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.metadata.description,
                    "category": t.metadata.category,
                    "reliability": t.metadata.reliability,
                    "parameters": t.metadata.parameters,
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

type BoxedToolFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

/// 闭包工具：把 `Fn(Value) -> Future` 包装为 Tool，便于测试与轻量注册
pub struct FnTool {
    f: Box<dyn Fn(Value) -> BoxedToolFuture + Send + Sync>,
}

impl FnTool {
    pub fn new<F, Fut>(f: F) -> Arc<dyn Tool>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        Arc::new(Self {
            f: Box::new(move |args| Box::pin(f(args))),
        })
    }
}

#[async_trait]
impl Tool for FnTool {
    async fn execute(&self, args: Value) -> Result<Value, String> {
        (self.f)(args).await
    }
}
