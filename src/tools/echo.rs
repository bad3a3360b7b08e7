//! Echo 工具（测试与兜底用）

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{ParamShape, ParamSpec, Reliability, Tool, ToolCategory, ToolMetadata};

/// Echo 工具：回显文本
pub struct EchoTool;

impl EchoTool {
    pub const NAME: &'static str = "echo";

    pub fn metadata() -> ToolMetadata {
        ToolMetadata::new(
            "Echo text back unchanged. Args: {\"text\": \"message\"}",
            ToolCategory::Utility,
        )
        .reliability(Reliability::High)
        .estimated_duration(Duration::from_millis(100))
        .param(ParamSpec::required("text", ParamShape::String))
        .output_shape(ParamShape::String)
    }
}

#[async_trait]
impl Tool for EchoTool {
    async fn execute(&self, args: Value) -> Result<Value, String> {
        let text = args
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        Ok(Value::String(text.to_string()))
    }
}
