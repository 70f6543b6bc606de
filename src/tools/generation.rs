//! generation 执行器：由模型生成文本；params.path 存在时写入沙箱作为产物

use async_trait::async_trait;
use serde_json::Value;

use crate::core::AgentError;
use crate::llm::{ask, LlmReply};
use crate::react::prompts;
use crate::react::Artifact;
use crate::tools::{ExecutorKind, StepExecutor, StepInput, StepOutput, TaskContext};

#[derive(Debug, Default)]
pub struct GenerationExecutor;

impl GenerationExecutor {
    pub fn new() -> Self {
        Self
    }
}

/// 结构化回复里取 content / text / answer 字段，否则整体转文本
fn generated_text(reply: &LlmReply) -> String {
    if let LlmReply::Structured(v) = reply {
        for key in ["content", "text", "answer"] {
            if let Some(s) = v.get(key).and_then(Value::as_str) {
                return s.to_string();
            }
        }
    }
    reply.to_text()
}

#[async_trait]
impl StepExecutor for GenerationExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Generation
    }

    async fn execute(&self, input: &StepInput<'_>, ctx: &TaskContext) -> Result<StepOutput, AgentError> {
        let reply = ask(ctx.llm(), &prompts::generation_system(), &input.describe(), &[]).await?;
        let text = generated_text(&reply);

        let mut artifacts = Vec::new();
        if let Some(path) = input.step.param_str("path") {
            let path = ctx.resolve_path(path);
            let sandbox = ctx.sandbox().await?;
            ctx.sandboxes().write_file(&sandbox, &path, &text).await?;
            artifacts.push(Artifact::inline(path, text.clone()));
        }
        Ok(StepOutput::new(Value::String(text)).with_artifacts(artifacts))
    }
}
