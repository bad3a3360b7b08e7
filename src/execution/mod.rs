//! 执行层：依赖图、占位符解析、置信度、生命周期事件与 ExecutionEngine

pub mod confidence;
pub mod engine;
pub mod events;
pub mod graph;
pub mod resolve;
pub mod result;

pub use confidence::{is_empty_output, plan_confidence, step_confidence};
pub use engine::ExecutionEngine;
pub use events::{EventSink, ExecutionEvent};
pub use graph::PlanGraph;
pub use resolve::resolve_params;
pub use result::{ExecutionReport, ExecutionSummary, StepResult, StepStatus};
