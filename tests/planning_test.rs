//! PlanningEngine / PlanValidator 集成测试

use std::sync::Arc;

use conductor::config::PlanningSection;
use conductor::core::AgentError;
use conductor::execution::PlanGraph;
use conductor::llm::MockLlmClient;
use conductor::planning::{
    CandidatePlan, CandidateStep, Condition, ParamValue, PlanStrategy, PlanValidator,
    PlanningContext, PlanningEngine,
};
use conductor::tools::{
    register_builtin_tools, Document, DocumentRepository, FnTool, InMemoryDocumentRepository,
    ToolCategory, ToolMetadata, ToolRegistry,
};
use proptest::prelude::*;
use serde_json::json;

fn noop_registry() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry
        .register(
            "noop",
            FnTool::new(|_| async { Ok(json!(null)) }),
            ToolMetadata::new("does nothing", ToolCategory::Utility),
        )
        .unwrap();
    Arc::new(registry)
}

fn builtin_registry() -> Arc<ToolRegistry> {
    let docs = Arc::new(InMemoryDocumentRepository::new());
    docs.put(Document::new("report", "Revenue grew 12% in Q3. Costs were flat."));
    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry, docs).unwrap();
    Arc::new(registry)
}

fn candidate_dag(edges: &[Vec<usize>]) -> CandidatePlan {
    CandidatePlan {
        steps: edges
            .iter()
            .enumerate()
            .map(|(i, deps)| CandidateStep {
                id: format!("s{i}"),
                tool: "noop".into(),
                depends_on: deps.iter().map(|d| format!("s{d}")).collect(),
                ..CandidateStep::default()
            })
            .collect(),
    }
}

proptest! {
    /// 任意依赖边：通过校验的计划一定无环且依赖都指向存在的步骤
    #[test]
    fn prop_accepted_plans_are_acyclic(
        edges in prop::collection::vec(prop::collection::vec(0usize..10, 0..4), 1..10)
    ) {
        let n = edges.len();
        let edges: Vec<Vec<usize>> = edges
            .into_iter()
            .map(|deps| deps.into_iter().map(|d| d % n).collect())
            .collect();
        let validator = PlanValidator::new(noop_registry(), 16);
        let ctx = PlanningContext::new("anything", "session");

        if let Ok(steps) = validator.validate(candidate_dag(&edges), &ctx) {
            let order = PlanGraph::new(&steps).topological_order();
            prop_assert!(order.is_ok());
            let order = order.unwrap();
            prop_assert_eq!(order.len(), steps.len());
            for step in &steps {
                let at = order.iter().position(|id| id == &step.id).unwrap();
                for dep in &step.dependencies {
                    let dep_at = order.iter().position(|id| id == dep);
                    prop_assert!(dep_at.is_some());
                    prop_assert!(dep_at.unwrap() < at);
                }
            }
        }
    }

    /// 只指向前序步骤的依赖一定被接受
    #[test]
    fn prop_backward_edges_always_accepted(
        edges in prop::collection::vec(prop::collection::vec(0usize..10, 0..4), 1..10)
    ) {
        let edges: Vec<Vec<usize>> = edges
            .into_iter()
            .enumerate()
            .map(|(i, deps)| {
                let mut deps: Vec<usize> = if i == 0 {
                    Vec::new()
                } else {
                    deps.into_iter().map(|d| d % i).collect()
                };
                deps.dedup();
                deps
            })
            .collect();
        let validator = PlanValidator::new(noop_registry(), 16);
        let ctx = PlanningContext::new("anything", "session");
        let steps = validator.validate(candidate_dag(&edges), &ctx);
        prop_assert!(steps.is_ok());
        prop_assert_eq!(steps.unwrap().len(), edges.len());
    }
}

#[test]
fn test_cycle_is_rejected() {
    let validator = PlanValidator::new(noop_registry(), 16);
    let ctx = PlanningContext::new("anything", "session");
    let result = validator.validate(candidate_dag(&[vec![2], vec![0], vec![1]]), &ctx);
    match result {
        Err(AgentError::PlanningError(message)) => assert!(message.contains("cycle")),
        other => panic!("expected cycle rejection, got {other:?}"),
    }
}

#[test]
fn test_validator_repairs_llm_output() {
    let validator = PlanValidator::new(builtin_registry(), 16);
    let mut ctx = PlanningContext::new("Summarize the report", "session");
    ctx.active_documents = vec!["report".into()];

    let candidate: CandidatePlan = serde_json::from_value(json!({
        "steps": [
            {"tool_name": "document_search", "params": {"documents": "$all_documents"}},
            {
                "tool": "summarize",
                "parameters": {"chunks": {"$ref": "s1.output"}},
                "condition": "on_success"
            }
        ]
    }))
    .unwrap();
    let steps = validator.validate(candidate, &ctx).unwrap();

    assert_eq!(steps[0].id, "s1");
    assert_eq!(steps[1].id, "s2");
    // 缺失的 query 从上下文补齐
    assert!(matches!(steps[0].params.get("query"), Some(ParamValue::Literal(_))));
    // 引用自动并入依赖，裸 on_success 绑定到该依赖
    assert_eq!(steps[1].dependencies, vec!["s1".to_string()]);
    assert_eq!(steps[1].condition, Condition::OnSuccess("s1".into()));
    assert!(matches!(steps[1].params.get("chunks"), Some(ParamValue::Ref(r)) if r.step_id == "s1"));
}

#[tokio::test]
async fn test_garbage_llm_output_falls_back() {
    let mock = Arc::new(MockLlmClient::with_responses(["I would rather write a poem."]));
    let engine = PlanningEngine::new(mock.clone(), builtin_registry(), &PlanningSection::default());
    let ctx = engine.context("Where is the revenue figure?", "session", &[], &[]);

    let plan = engine.plan(&ctx).await.unwrap();
    assert_eq!(plan.strategy, PlanStrategy::Fallback);
    assert_eq!(plan.len(), 1);
    assert_eq!(plan.steps[0].tool, "document_search");
    assert_eq!(plan.replans, PlanningSection::default().max_replans);
    assert_eq!(mock.calls(), PlanningSection::default().max_replans + 1);
    // 重新提示时带上校验错误
    let prompts = mock.prompts();
    assert!(!prompts[0].contains("## Correction"));
    assert!(prompts.last().unwrap().contains("## Correction"));
}

#[tokio::test]
async fn test_valid_llm_plan_accepted() {
    let plan_json = json!({
        "steps": [
            {"id": "find", "tool": "document_search", "parameters": {"query": "revenue", "documents": ["report"]}},
            {"id": "sum", "tool": "summarize", "parameters": {"chunks": {"$ref": "find.output"}}, "depends_on": ["find"]}
        ]
    })
    .to_string();
    let mock = Arc::new(MockLlmClient::with_responses([format!("Here is the plan:\n```json\n{plan_json}\n```")]));
    let engine = PlanningEngine::new(mock.clone(), builtin_registry(), &PlanningSection::default());
    let ctx = engine.context("Summarize revenue", "session", &["report".into()], &[]);

    let plan = engine.plan(&ctx).await.unwrap();
    assert_eq!(plan.strategy, PlanStrategy::Llm);
    assert_eq!(plan.replans, 0);
    assert_eq!(plan.len(), 2);
    assert_eq!(plan.step("sum").unwrap().dependencies, vec!["find".to_string()]);
    assert_eq!(mock.calls(), 1);
}
