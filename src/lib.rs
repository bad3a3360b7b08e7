//! conductor - 工具编排内核
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、重试策略、任务调度、编排器与构建器
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）及限流重试包装
//! - **tools**: 工具注册表、执行器、内置参考工具与命令工具
//! - **planning**: 条件语言、计划模型、查询分类、计划校验与 PlanningEngine
//! - **execution**: 依赖图、占位符解析、置信度与 ExecutionEngine
//! - **state**: 执行上下文、追踪日志与检查点
//! - **observability**: tracing 初始化

pub mod config;
pub mod core;
pub mod execution;
pub mod llm;
pub mod observability;
pub mod planning;
pub mod state;
pub mod tools;

pub use crate::core::{Orchestrator, OrchestratorBuilder, QueryRequest, QueryResponse};
