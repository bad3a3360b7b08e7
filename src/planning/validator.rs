//! 候选计划的修复与校验
//!
//! 先做确定性修复（补 ID、`$all_documents` 展开、缺失必填参数补默认值、引用与条件涉及的步骤并入依赖），
//! 再校验：步骤 ID 唯一、工具存在、占位符合法、条件只引用前序步骤、依赖构成 DAG。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::core::AgentError;
use crate::execution::PlanGraph;
use crate::planning::{
    CandidatePlan, CandidateStep, ConditionParser, ParamValue, PlanningContext, Step,
    StepOutputRef,
};
use crate::tools::{ParamShape, ParamSpec, ToolRegistry, ALL_DOCUMENTS};

/// 候选计划中代表「全部活动文档」的字符串
pub const ALL_DOCUMENTS_TOKEN: &str = "$all_documents";

/// 按名称判断为「文档」参数
const DOCUMENT_PARAMS: &[&str] = &["document", "documents", "doc", "docs", "doc_id", "file", "files"];
/// 按名称判断为「查询文本」参数
const QUERY_PARAMS: &[&str] = &["query", "question", "text", "prompt", "input"];

pub struct PlanValidator {
    registry: Arc<ToolRegistry>,
    max_steps: usize,
}

impl PlanValidator {
    pub fn new(registry: Arc<ToolRegistry>, max_steps: usize) -> Self {
        Self {
            registry,
            max_steps: max_steps.max(1),
        }
    }

    /// 修复并校验候选计划，返回可执行的步骤列表
    pub fn validate(
        &self,
        candidate: CandidatePlan,
        ctx: &PlanningContext,
    ) -> Result<Vec<Step>, AgentError> {
        if candidate.steps.is_empty() {
            return Err(AgentError::PlanningError("plan has no steps".to_string()));
        }
        if candidate.steps.len() > self.max_steps {
            return Err(AgentError::PlanningError(format!(
                "plan has {} steps, limit is {}",
                candidate.steps.len(),
                self.max_steps
            )));
        }

        let ids = assign_ids(&candidate.steps)?;
        let position: HashMap<&str, usize> =
            ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();

        let mut steps = Vec::with_capacity(candidate.steps.len());
        for (index, (raw, id)) in candidate.steps.into_iter().zip(ids.iter()).enumerate() {
            steps.push(self.build_step(index, id, raw, ctx, &position)?);
        }

        let graph = PlanGraph::new(&steps);
        if let Err(cyclic) = graph.topological_order() {
            return Err(AgentError::PlanningError(format!(
                "dependency cycle among steps: {}",
                cyclic.join(", ")
            )));
        }
        Ok(steps)
    }

    fn build_step(
        &self,
        index: usize,
        id: &str,
        raw: CandidateStep,
        ctx: &PlanningContext,
        position: &HashMap<&str, usize>,
    ) -> Result<Step, AgentError> {
        let entry = self.registry.lookup(&raw.tool)?;
        let metadata = &entry.metadata;

        let mut dependencies: Vec<String> = Vec::new();
        for dep in &raw.depends_on {
            if dep == id {
                return Err(AgentError::PlanningError(format!("step '{id}' depends on itself")));
            }
            if !position.contains_key(dep.as_str()) {
                return Err(AgentError::PlanningError(format!(
                    "step '{id}' depends on unknown step '{dep}'"
                )));
            }
            if !dependencies.contains(dep) {
                dependencies.push(dep.clone());
            }
        }

        let mut params = BTreeMap::new();
        for (name, value) in raw.parameters {
            let converted = convert_value(value, ctx)
                .map_err(|e| AgentError::PlanningError(format!("step '{id}' parameter '{name}': {e}")))?;
            params.insert(name, converted);
        }

        for spec in metadata.required_params() {
            if params.contains_key(&spec.name) {
                continue;
            }
            let value = contextual_default(spec, ctx, &dependencies).ok_or_else(|| {
                AgentError::PlanningError(format!(
                    "step '{id}' ({}) is missing required parameter '{}'",
                    raw.tool, spec.name
                ))
            })?;
            tracing::debug!(step_id = %id, param = %spec.name, "filled missing parameter");
            params.insert(spec.name.clone(), value);
        }

        // 引用到的步骤必须存在，并作为依赖保证其先终结
        for value in params.values() {
            for r in value.refs() {
                if r.step_id == id || !position.contains_key(r.step_id.as_str()) {
                    return Err(AgentError::PlanningError(format!(
                        "step '{id}' references unknown step output '{r}'"
                    )));
                }
                if !dependencies.contains(&r.step_id) {
                    dependencies.push(r.step_id.clone());
                }
            }
        }

        let condition = ConditionParser::parse(raw.condition.as_deref().unwrap_or(""), &dependencies);
        for referenced in condition.referenced_steps() {
            match position.get(referenced.as_str()) {
                Some(&at) if at < index => {
                    if !dependencies.contains(&referenced) {
                        dependencies.push(referenced);
                    }
                }
                _ => {
                    return Err(AgentError::PlanningError(format!(
                        "step '{id}' condition '{condition}' must reference an earlier step, not '{referenced}'"
                    )))
                }
            }
        }

        Ok(Step {
            id: id.to_string(),
            tool: raw.tool,
            params,
            dependencies,
            condition,
            estimated_duration: metadata.estimated_duration,
            description: raw.description,
        })
    }
}

/// 缺失 ID 的步骤按位置补 `s{n}`；重复 ID 拒绝
fn assign_ids(steps: &[CandidateStep]) -> Result<Vec<String>, AgentError> {
    let mut seen = HashSet::new();
    let mut ids = Vec::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        let id = if step.id.trim().is_empty() {
            format!("s{}", i + 1)
        } else {
            step.id.trim().to_string()
        };
        if !seen.insert(id.clone()) {
            return Err(AgentError::PlanningError(format!("duplicate step id '{id}'")));
        }
        ids.push(id);
    }
    Ok(ids)
}

/// 把候选参数转为 ParamValue：`{"$ref": ...}` 转为引用，`"$all_documents"` 展开为调用方文档列表
fn convert_value(value: Value, ctx: &PlanningContext) -> Result<ParamValue, String> {
    match value {
        Value::String(s) if s.trim() == ALL_DOCUMENTS_TOKEN => Ok(ParamValue::Literal(Value::Array(
            ctx.active_documents
                .iter()
                .cloned()
                .map(Value::String)
                .collect(),
        ))),
        Value::Object(map) if map.contains_key("$ref") => {
            if map.len() != 1 {
                return Err("a $ref object must have no other keys".to_string());
            }
            let target = map
                .get("$ref")
                .and_then(Value::as_str)
                .ok_or("$ref must be a string")?;
            StepOutputRef::parse(target)
                .map(ParamValue::Ref)
                .ok_or_else(|| format!("'{target}' does not match <stepId>.output[.<key>]*"))
        }
        Value::Array(items) => {
            let converted = items
                .into_iter()
                .map(|v| convert_value(v, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            if converted.iter().all(|v| matches!(v, ParamValue::Literal(_))) {
                Ok(ParamValue::Literal(Value::Array(
                    converted.into_iter().map(|v| v.to_json()).collect(),
                )))
            } else {
                Ok(ParamValue::List(converted))
            }
        }
        Value::Object(map) => {
            let converted = map
                .into_iter()
                .map(|(k, v)| convert_value(v, ctx).map(|v| (k, v)))
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            if converted.values().all(|v| matches!(v, ParamValue::Literal(_))) {
                Ok(ParamValue::Literal(Value::Object(
                    converted.into_iter().map(|(k, v)| (k, v.to_json())).collect(),
                )))
            } else {
                Ok(ParamValue::Object(converted))
            }
        }
        other => Ok(ParamValue::Literal(other)),
    }
}

/// 缺失必填参数的上下文默认值
///
/// 文档类参数：唯一活动文档时取该文档，否则取「全部文档」哨兵；查询类参数：取原始查询；
/// 其它参数：有依赖时引用最后一个依赖的输出。
pub(crate) fn contextual_default(spec: &ParamSpec, ctx: &PlanningContext, dependencies: &[String]) -> Option<ParamValue> {
    let name = spec.name.to_lowercase();
    if DOCUMENT_PARAMS.contains(&name.as_str()) {
        let doc = match ctx.active_documents.as_slice() {
            [single] => single.clone(),
            _ => ALL_DOCUMENTS.to_string(),
        };
        let value = match spec.shape {
            ParamShape::Sequence => Value::Array(vec![Value::String(doc)]),
            _ => Value::String(doc),
        };
        return Some(ParamValue::Literal(value));
    }
    if QUERY_PARAMS.contains(&name.as_str())
        && matches!(spec.shape, ParamShape::String | ParamShape::Any)
        && dependencies.is_empty()
    {
        return Some(ParamValue::Literal(Value::String(ctx.query.clone())));
    }
    dependencies
        .last()
        .map(|dep| ParamValue::Ref(StepOutputRef::new(dep.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planning::{Condition, QueryType};
    use crate::tools::{FnTool, ToolCategory, ToolMetadata};
    use serde_json::json;

    fn registry() -> Arc<ToolRegistry> {
        let mut r = ToolRegistry::new();
        let noop = || FnTool::new(|_| async { Ok(Value::Null) });
        r.register(
            "search",
            noop(),
            ToolMetadata::new("search", ToolCategory::Search)
                .param(ParamSpec::required("query", ParamShape::String))
                .param(ParamSpec::required("documents", ParamShape::Sequence)),
        )
        .unwrap();
        r.register(
            "summarize",
            noop(),
            ToolMetadata::new("summarize", ToolCategory::Synthesis)
                .param(ParamSpec::required("chunks", ParamShape::Sequence)),
        )
        .unwrap();
        Arc::new(r)
    }

    fn ctx(docs: &[&str]) -> PlanningContext {
        PlanningContext {
            query: "what changed?".to_string(),
            session_id: "sess".to_string(),
            active_documents: docs.iter().map(|d| d.to_string()).collect(),
            history: Vec::new(),
            available_tools: vec!["search".into(), "summarize".into()],
            query_type: QueryType::DocumentAnalysis,
        }
    }

    fn candidate(v: Value) -> CandidatePlan {
        serde_json::from_value(v).unwrap()
    }

    fn validator() -> PlanValidator {
        PlanValidator::new(registry(), 10)
    }

    #[test]
    fn test_refs_become_typed_and_add_dependencies() {
        let steps = validator()
            .validate(
                candidate(json!({"steps": [
                    {"id": "s1", "tool": "search", "parameters": {"query": "q", "documents": "$all_documents"}},
                    {"id": "s2", "tool": "summarize", "parameters": {"chunks": {"$ref": "s1.output"}}}
                ]})),
                &ctx(&["a.pdf", "b.pdf"]),
            )
            .unwrap();
        assert_eq!(steps[0].params["documents"], ParamValue::Literal(json!(["a.pdf", "b.pdf"])));
        assert_eq!(steps[1].params["chunks"], ParamValue::Ref(StepOutputRef::new("s1")));
        assert_eq!(steps[1].dependencies, vec!["s1".to_string()]);
    }

    #[test]
    fn test_missing_params_repaired_from_context() {
        let steps = validator()
            .validate(
                candidate(json!({"steps": [
                    {"tool": "search"},
                    {"tool": "summarize", "depends_on": ["s1"], "condition": "on_success"}
                ]})),
                &ctx(&["a.pdf"]),
            )
            .unwrap();
        assert_eq!(steps[0].id, "s1");
        assert_eq!(steps[0].params["query"], ParamValue::Literal(json!("what changed?")));
        assert_eq!(steps[0].params["documents"], ParamValue::Literal(json!(["a.pdf"])));
        assert_eq!(steps[1].params["chunks"], ParamValue::Ref(StepOutputRef::new("s1")));
        assert_eq!(steps[1].condition, Condition::OnSuccess("s1".into()));
    }

    #[test]
    fn test_ambiguous_documents_use_sentinel() {
        let steps = validator()
            .validate(
                candidate(json!({"steps": [{"id": "s1", "tool": "search", "parameters": {"query": "x"}}]})),
                &ctx(&[]),
            )
            .unwrap();
        assert_eq!(steps[0].params["documents"], ParamValue::Literal(json!([ALL_DOCUMENTS])));
    }

    #[test]
    fn test_rejections() {
        let v = validator();
        let c = ctx(&["a.pdf"]);
        let unknown_tool = v.validate(candidate(json!({"steps": [{"id": "s1", "tool": "nope"}]})), &c);
        assert!(matches!(unknown_tool, Err(AgentError::ToolNotFound(t)) if t == "nope"));

        let dup = v.validate(
            candidate(json!({"steps": [{"id": "s1", "tool": "search"}, {"id": "s1", "tool": "search"}]})),
            &c,
        );
        assert!(matches!(dup, Err(AgentError::PlanningError(_))));

        let bad_ref = v.validate(
            candidate(json!({"steps": [
                {"id": "s1", "tool": "search"},
                {"id": "s2", "tool": "summarize", "parameters": {"chunks": {"$ref": "s1.result"}}}
            ]})),
            &c,
        );
        assert!(matches!(bad_ref, Err(AgentError::PlanningError(_))));

        let cycle = v.validate(
            candidate(json!({"steps": [
                {"id": "s1", "tool": "summarize", "depends_on": ["s2"]},
                {"id": "s2", "tool": "summarize", "depends_on": ["s1"]}
            ]})),
            &c,
        );
        assert!(matches!(cycle, Err(AgentError::PlanningError(m)) if m.contains("cycle")));

        let later_condition = v.validate(
            candidate(json!({"steps": [
                {"id": "s1", "tool": "search", "condition": "s2.success"},
                {"id": "s2", "tool": "search"}
            ]})),
            &c,
        );
        assert!(matches!(later_condition, Err(AgentError::PlanningError(_))));
    }

    #[test]
    fn test_custom_condition_steps_become_dependencies() {
        let steps = validator()
            .validate(
                candidate(json!({"steps": [
                    {"id": "s1", "tool": "search"},
                    {"id": "s2", "tool": "search"},
                    {"id": "s3", "tool": "summarize", "parameters": {"chunks": {"$ref": "s2.output"}},
                     "condition": "len(s1.output) > 0"}
                ]})),
                &ctx(&["a.pdf"]),
            )
            .unwrap();
        assert_eq!(steps[2].dependencies, vec!["s2".to_string(), "s1".to_string()]);
        assert!(matches!(steps[2].condition, Condition::Custom(_)));
    }
}
