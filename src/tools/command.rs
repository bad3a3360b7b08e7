//! 命令工具：由配置 [[tools.commands]] 注册，运行「程序 + 参数模板」扩展外部能力（代码执行、绘图脚本等）
//!
//! 参数模板中 {{key}} 从步骤参数中取 key；执行时无 shell，直接 exec program + substituted args。
//! stdout 若是合法 JSON 则按 JSON 返回，否则返回去除首尾空白的文本。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::config::CommandEntry;
use crate::tools::{Tool, ToolMetadata};

/// 从配置项构建的命令工具
pub struct CommandTool {
    name: String,
    program: String,
    args_template: Vec<String>,
    timeout: Duration,
}

impl CommandTool {
    /// 从配置条目创建；timeout 由 ExecutionSection::step_timeout 按预估耗时算出
    pub fn new(entry: &CommandEntry, timeout: Duration) -> Self {
        Self {
            name: entry.name.clone(),
            program: entry.program.clone(),
            args_template: entry.args.clone(),
            timeout,
        }
    }

    pub fn metadata(entry: &CommandEntry) -> ToolMetadata {
        let mut metadata = ToolMetadata::new(entry.description.clone(), entry.category)
            .reliability(entry.reliability)
            .estimated_duration(Duration::from_millis(entry.estimated_duration_ms))
            .output_shape(entry.output_shape);
        for spec in &entry.parameters {
            metadata = metadata.param(spec.clone());
        }
        metadata
    }

    /// 替换模板中的 {{key}}；args 为步骤解析后的 JSON 对象
    fn substitute(&self, args: &Value) -> Vec<String> {
        let empty = serde_json::Map::new();
        let obj = args.as_object().unwrap_or(&empty);
        self.args_template
            .iter()
            .map(|tpl| {
                let mut s = tpl.clone();
                for (k, v) in obj {
                    let placeholder = format!("{{{{{}}}}}", k);
                    let val: String = match v {
                        Value::String(x) => x.clone(),
                        _ => v.to_string(),
                    };
                    s = s.replace(&placeholder, &val);
                }
                s
            })
            .collect()
    }
}

#[async_trait]
impl Tool for CommandTool {
    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args_vec = self.substitute(&args);
        tracing::info!(tool = %self.name, program = %self.program, "command tool invoke");
        let child = Command::new(&self.program)
            .args(&args_vec)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("command spawn failed: {}", e))?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| format!("command timeout after {}ms", self.timeout.as_millis()))?
            .map_err(|e| format!("command wait failed: {}", e))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(format!(
                "exit {:?}: stderr {}",
                output.status.code(),
                stderr.trim()
            ));
        }
        let text = stdout.trim();
        Ok(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ParamShape, ParamSpec, Reliability, ToolCategory};
    use serde_json::json;

    fn entry(program: &str, args: &[&str]) -> CommandEntry {
        CommandEntry {
            name: "run".to_string(),
            description: "runs a program".to_string(),
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            category: ToolCategory::Computation,
            reliability: Reliability::Low,
            estimated_duration_ms: 500,
            parameters: vec![ParamSpec::required("expr", ParamShape::String)],
            output_shape: ParamShape::Any,
        }
    }

    #[test]
    fn test_metadata_from_entry() {
        let meta = CommandTool::metadata(&entry("echo", &[]));
        assert_eq!(meta.category, ToolCategory::Computation);
        assert_eq!(meta.reliability, Reliability::Low);
        assert_eq!(meta.estimated_duration, Duration::from_millis(500));
        assert!(meta.param_spec("expr").unwrap().required);
    }

    #[test]
    fn test_substitute_placeholders() {
        let tool = CommandTool::new(&entry("echo", &["--value={{expr}}", "{{n}}"]), Duration::from_secs(1));
        let args = tool.substitute(&json!({"expr": "1+1", "n": 3}));
        assert_eq!(args, vec!["--value=1+1".to_string(), "3".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_output_parsed_as_json() {
        let tool = CommandTool::new(&entry("echo", &["[1, 2, {{expr}}]"]), Duration::from_secs(5));
        let out = tool.execute(json!({"expr": "3"})).await.unwrap();
        assert_eq!(out, json!([1, 2, 3]));
    }
}
