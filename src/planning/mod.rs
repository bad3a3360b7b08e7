//! 规划层：条件解析、计划模型、查询分类、计划校验与 PlanningEngine

pub mod classifier;
pub mod condition;
pub mod engine;
pub mod plan;
pub mod schema;
pub mod validator;

pub use classifier::QueryClassifier;
pub use condition::{Condition, ConditionParser, SafeExpr, StepView};
pub use engine::{extract_candidate, PlanningEngine};
pub use plan::{
    ConversationTurn, ParamValue, Plan, PlanStrategy, PlanningContext, QueryType, Step,
    StepOutputRef,
};
pub use schema::{plan_schema_json, CandidatePlan, CandidateStep};
pub use validator::{PlanValidator, ALL_DOCUMENTS_TOKEN};
