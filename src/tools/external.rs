//! toolCall 执行器：调用外部工具服务器暴露的能力
//!
//! params 形如 `{"server": "...", "tool": "...", "arguments": {...}}`；省略 server 时按能力名查找。
//! 没有给出 tool 时，把已发现的能力清单交给模型选择。

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::AgentError;
use crate::llm::{ask, LlmReply};
use crate::protocol::Capability;
use crate::react::prompts;
use crate::tools::{ExecutorKind, StepExecutor, StepInput, StepOutput, TaskContext};

/// 一次具体调用
#[derive(Debug, Clone, PartialEq)]
struct ToolCall {
    server: Option<String>,
    tool: String,
    arguments: Value,
}

impl ToolCall {
    fn from_value(v: &Value) -> Option<Self> {
        let tool = v
            .get("tool")
            .or_else(|| v.get("name"))
            .and_then(Value::as_str)?
            .trim()
            .to_string();
        if tool.is_empty() {
            return None;
        }
        let server = v
            .get("server")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|s| !s.is_empty());
        let arguments = match v.get("arguments") {
            Some(a) if !a.is_null() => a.clone(),
            _ => json!({}),
        };
        Some(Self {
            server,
            tool,
            arguments,
        })
    }
}

/// 能力清单文本：每行 `- server / name: description schema`
pub fn render_catalog(caps: &[(String, Capability)]) -> String {
    caps.iter()
        .map(|(server, c)| {
            let schema = if c.input_schema.is_null() {
                String::new()
            } else {
                format!(" {}", c.input_schema)
            };
            format!("- {} / {}: {}{}", server, c.name, c.description, schema)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Default)]
pub struct ToolCallExecutor;

impl ToolCallExecutor {
    pub fn new() -> Self {
        Self
    }

    async fn choose(&self, input: &StepInput<'_>, ctx: &TaskContext) -> Result<ToolCall, AgentError> {
        if let Some(call) = ToolCall::from_value(&input.step.params) {
            return Ok(call);
        }
        let caps = ctx.protocol().all_capabilities().await;
        if caps.is_empty() {
            return Err(AgentError::StepFailed(
                "no external tools are available".to_string(),
            ));
        }
        let system = prompts::tool_choice_system(&render_catalog(&caps));
        let reply = ask(ctx.llm(), &system, &input.describe(), &[]).await?;
        match &reply {
            LlmReply::Structured(v) => ToolCall::from_value(v).ok_or_else(|| {
                AgentError::JsonParseError(format!("tool choice without a tool name: {}", v))
            }),
            LlmReply::Text(t) => Err(AgentError::JsonParseError(format!(
                "tool choice expected as JSON, got: {}",
                t.chars().take(200).collect::<String>()
            ))),
        }
    }
}

#[async_trait]
impl StepExecutor for ToolCallExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::ToolCall
    }

    async fn execute(&self, input: &StepInput<'_>, ctx: &TaskContext) -> Result<StepOutput, AgentError> {
        let call = self.choose(input, ctx).await?;
        let server = match call.server {
            Some(s) => s,
            None => ctx
                .protocol()
                .find_capability(&call.tool)
                .await
                .ok_or_else(|| AgentError::StepFailed(format!("no server provides {}", call.tool)))?,
        };
        tracing::info!(step = input.index, server = %server, tool = %call.tool, "calling external tool");
        let result = ctx
            .protocol()
            .invoke(&server, &call.tool, call.arguments)
            .await?;
        Ok(StepOutput::new(json!({
            "server": server,
            "tool": call.tool,
            "result": result,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_call_from_params() {
        let call = ToolCall::from_value(&json!({"tool": "read_file", "arguments": {"path": "a"}})).unwrap();
        assert_eq!(call.server, None);
        assert_eq!(call.tool, "read_file");
        assert_eq!(call.arguments, json!({"path": "a"}));

        let call = ToolCall::from_value(&json!({"server": "fs", "name": "ls"})).unwrap();
        assert_eq!(call.server.as_deref(), Some("fs"));
        assert_eq!(call.arguments, json!({}));

        assert!(ToolCall::from_value(&Value::Null).is_none());
        assert!(ToolCall::from_value(&json!({"tool": " "})).is_none());
    }

    #[test]
    fn test_render_catalog() {
        let caps = vec![(
            "fs".to_string(),
            Capability {
                name: "ls".to_string(),
                description: "list files".to_string(),
                input_schema: Value::Null,
            },
        )];
        assert_eq!(render_catalog(&caps), "- fs / ls: list files");
    }
}
