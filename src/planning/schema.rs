//! 候选计划格式与 JSON Schema（schemars 自动生成，拼入规划提示词）
//!
//! LLM 输出按此结构反序列化；字段别名用于容忍常见写法（params / dependencies / tool_name）。

use std::collections::BTreeMap;

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// LLM 输出的候选计划
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CandidatePlan {
    /// 按执行顺序列出的步骤；条件与引用只能指向排在前面的步骤
    pub steps: Vec<CandidateStep>,
}

/// 候选步骤
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CandidateStep {
    /// 计划内唯一的步骤 ID，如 s1、s2
    #[serde(default)]
    pub id: String,
    /// 注册表中的工具名
    #[serde(alias = "tool_name")]
    pub tool: String,
    /// 命名参数；引用前序步骤输出写作 {"$ref": "s1.output"} 或 {"$ref": "s1.output.hits.0"}，
    /// 字符串 "$all_documents" 表示全部活动文档
    #[serde(default, alias = "params", alias = "args")]
    pub parameters: BTreeMap<String, Value>,
    /// 依赖的步骤 ID
    #[serde(default, alias = "dependencies", alias = "depends")]
    pub depends_on: Vec<String>,
    /// always / on_success / on_failure / s1.success / s1.failure / 受限表达式，如 len(s1.output) > 0
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// 候选计划的 JSON Schema 字符串
pub fn plan_schema_json() -> String {
    let schema = schema_for!(CandidatePlan);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
