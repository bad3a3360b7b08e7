pub mod command;
pub mod documents;
pub mod echo;
pub mod executor;
pub mod registry;
pub mod text;

use std::sync::Arc;

pub use command::CommandTool;
pub use documents::{
    Document, DocumentRepository, DocumentSearchTool, InMemoryDocumentRepository, ALL_DOCUMENTS,
};
pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{
    FnTool, ParamShape, ParamSpec, RegisteredTool, RegistryStats, Reliability, Tool,
    ToolCategory, ToolMetadata, ToolRegistry,
};
pub use text::{SummarizeTool, TextStatsTool};

use crate::core::AgentError;

/// 注册内置参考工具（echo / document_search / summarize / text_stats）
pub fn register_builtin_tools(
    registry: &mut ToolRegistry,
    documents: Arc<dyn DocumentRepository>,
) -> Result<(), AgentError> {
    registry.register(EchoTool::NAME, Arc::new(EchoTool), EchoTool::metadata())?;
    registry.register(
        DocumentSearchTool::NAME,
        Arc::new(DocumentSearchTool::new(documents)),
        DocumentSearchTool::metadata(),
    )?;
    registry.register(
        SummarizeTool::NAME,
        Arc::new(SummarizeTool),
        SummarizeTool::metadata(),
    )?;
    registry.register(
        TextStatsTool::NAME,
        Arc::new(TextStatsTool),
        TextStatsTool::metadata(),
    )?;
    Ok(())
}
