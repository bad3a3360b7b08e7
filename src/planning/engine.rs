//! PlanningEngine：把 PlanningContext 变成校验通过的 Plan
//!
//! 流程：分类查询 → 带工具清单 / 计划 Schema / 对话历史提示 LLM → 提取 JSON → 修复与校验。
//! 校验失败时把错误附加到提示中重新规划（次数受 max_replans 限制），仍失败则回退为按查询类型选出的单步计划。
//! 规划失败在本地恢复，只有配置错误与「回退计划耗尽」会上抛。

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::config::PlanningSection;
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::llm::LlmClient;
use crate::planning::validator::contextual_default;
use crate::planning::{
    plan_schema_json, CandidatePlan, ConversationTurn, Plan, PlanStrategy,
    PlanValidator, PlanningContext, QueryClassifier, Step, ALL_DOCUMENTS_TOKEN,
};
use crate::tools::{ToolCategory, ToolRegistry};

/// 回退时在查询类型偏好之后依次尝试的类别
const FALLBACK_CATEGORIES: &[ToolCategory] = &[
    ToolCategory::Search,
    ToolCategory::Synthesis,
    ToolCategory::Utility,
];

pub struct PlanningEngine {
    llm: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    validator: PlanValidator,
    recovery: RecoveryEngine,
    max_replans: usize,
    history_turns: usize,
}

impl PlanningEngine {
    pub fn new(llm: Arc<dyn LlmClient>, registry: Arc<ToolRegistry>, cfg: &PlanningSection) -> Self {
        Self {
            validator: PlanValidator::new(Arc::clone(&registry), cfg.max_steps),
            llm,
            registry,
            recovery: RecoveryEngine::new(),
            max_replans: cfg.max_replans,
            history_turns: cfg.history_turns,
        }
    }

    /// 构造规划上下文：推断查询类型并快照当前注册表中的工具名
    pub fn context(
        &self,
        query: &str,
        session_id: &str,
        active_documents: &[String],
        history: &[ConversationTurn],
    ) -> PlanningContext {
        PlanningContext {
            query: query.to_string(),
            session_id: session_id.to_string(),
            active_documents: active_documents.to_vec(),
            history: history.to_vec(),
            available_tools: self.registry.tool_names(),
            query_type: QueryClassifier::classify(query, active_documents.len()),
        }
    }

    /// 生成计划；永远不会返回「没有计划」，除非配置错误或回退计划耗尽
    pub async fn plan(&self, ctx: &PlanningContext) -> Result<Plan, AgentError> {
        let mut replans_left = self.max_replans;
        let mut replans = 0;
        let mut feedback: Option<String> = None;

        loop {
            let prompt = self.build_prompt(ctx, feedback.as_deref());
            let attempt = match self.llm.complete(&prompt).await {
                Ok(text) => extract_candidate(&text).and_then(|c| self.validator.validate(c, ctx)),
                Err(e) => Err(AgentError::from(e)),
            };

            let err = match attempt {
                Ok(steps) => {
                    let mut plan = Plan::new(ctx, PlanStrategy::Llm, steps);
                    plan.replans = replans;
                    tracing::info!(
                        plan_id = %plan.id,
                        steps = plan.len(),
                        replans,
                        query_type = %ctx.query_type,
                        "plan accepted"
                    );
                    return Ok(plan);
                }
                Err(err) => err,
            };

            if err.is_fatal() {
                return Err(err);
            }
            match self.recovery.handle(&err, replans_left) {
                RecoveryAction::RetryWithPrompt(message) => {
                    tracing::warn!(error = %err, replans_left, "plan rejected, re-prompting");
                    feedback = Some(message);
                    replans_left -= 1;
                    replans += 1;
                }
                RecoveryAction::Abort => return Err(err),
                _ => {
                    tracing::warn!(error = %err, "planning failed, using fallback plan");
                    let mut plan = self.fallback_plan(ctx)?;
                    plan.replans = replans;
                    return Ok(plan);
                }
            }
        }
    }

    /// 单步回退计划：按查询类型偏好类别，再 Search / Synthesis / Utility，最后任意工具，
    /// 取第一个必填参数都能从上下文补齐的工具
    pub fn fallback_plan(&self, ctx: &PlanningContext) -> Result<Plan, AgentError> {
        let mut categories: Vec<ToolCategory> = Vec::new();
        for c in ctx
            .query_type
            .preferred_categories()
            .iter()
            .chain(FALLBACK_CATEGORIES)
        {
            if !categories.contains(c) {
                categories.push(*c);
            }
        }

        let preferred = categories
            .iter()
            .flat_map(|c| self.registry.list_by_category(*c));
        let candidates = preferred.chain(self.registry.tools().iter());

        for tool in candidates {
            let mut params = BTreeMap::new();
            let mut fillable = true;
            for spec in &tool.metadata.parameters {
                match contextual_default(spec, ctx, &[]) {
                    Some(v) => {
                        // 可选参数只补文档类，避免把查询塞进无关字段
                        if spec.required || is_document_param(&spec.name) {
                            params.insert(spec.name.clone(), v);
                        }
                    }
                    None if spec.required => {
                        fillable = false;
                        break;
                    }
                    None => {}
                }
            }
            if !fillable {
                continue;
            }
            let mut step = Step::new("s1", tool.name.clone())
                .estimated_duration(tool.metadata.estimated_duration);
            step.params = params;
            step.description = Some(format!("fallback for {} query", ctx.query_type));
            tracing::info!(tool = %tool.name, query_type = %ctx.query_type, "fallback plan");
            return Ok(Plan::new(ctx, PlanStrategy::Fallback, vec![step]));
        }

        Err(AgentError::FallbackExhausted(format!(
            "no registered tool can serve a {} query",
            ctx.query_type
        )))
    }

    fn build_prompt(&self, ctx: &PlanningContext, feedback: Option<&str>) -> String {
        let stats = serde_json::to_string(&self.registry.stats()).unwrap_or_default();
        let documents = if ctx.active_documents.is_empty() {
            "(none)".to_string()
        } else {
            ctx.active_documents.join(", ")
        };
        let history = ctx
            .history
            .iter()
            .rev()
            .take(self.history_turns)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|t| format!("{}: {}", t.role, t.content))
            .collect::<Vec<_>>()
            .join("\n");

        let mut prompt = format!(
            "You are the planner of a tool orchestration system. Break the user request into \
             a small dependency graph of tool calls.\n\n\
             ## Available tools\n{tools}\n\nRegistry summary: {stats}\n\n\
             ## Plan format (JSON Schema)\n{schema}\n\n\
             ## Rules\n\
             - Use only the tools listed above and their parameter names.\n\
             - To pass a previous step's output use {{\"$ref\": \"<step_id>.output\"}} \
               (optionally .<key> or .<index> after output).\n\
             - Use the string \"{all_docs}\" to mean every active document.\n\
             - condition is one of: always, on_success, on_failure, <step_id>.success, \
               <step_id>.failure, or an expression such as len(s1.output) > 0.\n\
             - Conditions and references may only point at earlier steps; no cycles.\n\
             - Reply with the JSON plan only.\n\n\
             ## Context\nQuery type: {query_type}\nActive documents: {documents}\n",
            tools = self.registry.to_schema_json(),
            stats = stats,
            schema = plan_schema_json(),
            all_docs = ALL_DOCUMENTS_TOKEN,
            query_type = ctx.query_type,
            documents = documents,
        );
        if !history.is_empty() {
            prompt.push_str("\n## Conversation so far\n");
            prompt.push_str(&history);
            prompt.push('\n');
        }
        prompt.push_str("\n## Request\n");
        prompt.push_str(&ctx.query);
        prompt.push('\n');
        if let Some(feedback) = feedback {
            prompt.push_str("\n## Correction\n");
            prompt.push_str(feedback);
            prompt.push('\n');
        }
        prompt
    }
}

fn is_document_param(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "document" | "documents" | "doc" | "docs" | "doc_id" | "file" | "files"
    )
}

/// 从 LLM 文本中提取候选计划：```json 代码块、首个 `{`/`[` 到末个 `}`/`]`；裸数组视为步骤列表
pub fn extract_candidate(output: &str) -> Result<CandidatePlan, AgentError> {
    let trimmed = output.trim();
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else {
        let open = trimmed.find(['{', '[']);
        let close = trimmed.rfind(['}', ']']);
        match (open, close) {
            (Some(start), Some(end)) if end > start => &trimmed[start..=end],
            _ => {
                return Err(AgentError::PlanningError(
                    "no JSON plan found in planner output".to_string(),
                ))
            }
        }
    };

    let value: Value = serde_json::from_str(json_str)
        .map_err(|e| AgentError::PlanningError(format!("invalid plan JSON: {e}")))?;
    let value = match value {
        Value::Array(steps) => serde_json::json!({ "steps": steps }),
        other => other,
    };
    serde_json::from_value(value)
        .map_err(|e| AgentError::PlanningError(format!("plan does not match schema: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::planning::{ParamValue, QueryType, StepOutputRef};
    use crate::tools::{
        register_builtin_tools, Document, DocumentRepository, InMemoryDocumentRepository,
    };
    use serde_json::json;

    fn literal(value: impl Into<Value>) -> ParamValue {
        ParamValue::Literal(value.into())
    }

    fn registry() -> Arc<ToolRegistry> {
        let docs = InMemoryDocumentRepository::new();
        docs.put(Document::new("a.pdf", "Revenue grew."));
        let docs: Arc<dyn DocumentRepository> = Arc::new(docs);
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, docs).unwrap();
        Arc::new(registry)
    }

    fn engine(mock: Arc<MockLlmClient>) -> PlanningEngine {
        PlanningEngine::new(mock, registry(), &PlanningSection::default())
    }

    const GOOD_PLAN: &str = r#"Here is the plan:
```json
{"steps": [
  {"id": "s1", "tool": "document_search", "parameters": {"query": "revenue", "documents": "$all_documents"}},
  {"id": "s2", "tool": "summarize", "parameters": {"chunks": {"$ref": "s1.output"}}, "depends_on": ["s1"]}
]}
```"#;

    #[test]
    fn test_extract_candidate_variants() {
        let plan = extract_candidate(GOOD_PLAN).unwrap();
        assert_eq!(plan.steps.len(), 2);
        let plan = extract_candidate(r#"sure: [{"id": "s1", "tool": "echo"}] done"#).unwrap();
        assert_eq!(plan.steps[0].tool, "echo");
        assert!(extract_candidate("I cannot help with that").is_err());
    }

    #[tokio::test]
    async fn test_plan_accepted_first_try() {
        let mock = Arc::new(MockLlmClient::with_responses([GOOD_PLAN]));
        let engine = engine(mock.clone());
        let ctx = engine.context("summarize revenue", "sess", &["a.pdf".to_string()], &[]);
        let plan = engine.plan(&ctx).await.unwrap();
        assert_eq!(plan.strategy, PlanStrategy::Llm);
        assert_eq!(plan.replans, 0);
        assert_eq!(plan.steps[0].params["documents"], literal(json!(["a.pdf"])));
        assert_eq!(plan.steps[1].params["chunks"], ParamValue::Ref(StepOutputRef::new("s1")));
        assert!(mock.prompts()[0].contains("document_search"));
    }

    #[tokio::test]
    async fn test_reprompt_with_validation_error() {
        let mock = Arc::new(MockLlmClient::with_responses([
            r#"{"steps": [{"id": "s1", "tool": "web_browser"}]}"#,
            GOOD_PLAN,
        ]));
        let engine = engine(mock.clone());
        let ctx = engine.context("summarize revenue", "sess", &["a.pdf".to_string()], &[]);
        let plan = engine.plan(&ctx).await.unwrap();
        assert_eq!(plan.strategy, PlanStrategy::Llm);
        assert_eq!(plan.replans, 1);
        let prompts = mock.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("web_browser"));
    }

    #[tokio::test]
    async fn test_falls_back_after_budget() {
        let mock = Arc::new(MockLlmClient::with_responses(["no json here"]));
        let engine = engine(mock.clone());
        let ctx = engine.context("who is the CEO?", "sess", &[], &[]);
        assert_eq!(ctx.query_type, QueryType::Lookup);
        let plan = engine.plan(&ctx).await.unwrap();
        assert_eq!(plan.strategy, PlanStrategy::Fallback);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].tool, "document_search");
        assert_eq!(plan.steps[0].params["query"], literal("who is the CEO?"));
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn test_config_error_is_surfaced() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push(Err(crate::llm::LlmError::Configuration("no key".into())));
        let engine = engine(mock);
        let ctx = engine.context("anything", "sess", &[], &[]);
        assert!(matches!(engine.plan(&ctx).await, Err(AgentError::ConfigError(_))));
    }

    #[test]
    fn test_fallback_exhausted_with_unfillable_tools() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                "plot",
                crate::tools::FnTool::new(|_| async { Ok(Value::Null) }),
                crate::tools::ToolMetadata::new("plot", ToolCategory::Visualization)
                    .param(crate::tools::ParamSpec::required("series", crate::tools::ParamShape::Sequence)),
            )
            .unwrap();
        let engine = PlanningEngine::new(
            Arc::new(MockLlmClient::new()),
            Arc::new(registry),
            &PlanningSection::default(),
        );
        let ctx = engine.context("plot it", "sess", &[], &[]);
        assert!(matches!(engine.fallback_plan(&ctx), Err(AgentError::FallbackExhausted(_))));
    }
}
