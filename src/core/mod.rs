//! 核心编排层：错误与恢复、重试策略、任务调度、编排器与构建器

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod retry;
pub mod task_scheduler;

pub use builder::{create_orchestrator_builder, OrchestratorBuilder};
pub use error::{AgentError, RecoveryAction};
pub use orchestrator::{
    digest, Orchestrator, QueryRequest, QueryResponse, ResponseStatus, StreamEvent,
};
pub use recovery::RecoveryEngine;
pub use retry::RetryPolicy;
pub use task_scheduler::{TaskKind, TaskPermit, TaskScheduler};
