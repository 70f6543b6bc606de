//! codeExecution 执行器：把程序写入沙箱并运行
//!
//! 程序来自 params `{language, code}`，或由模型生成；脚本路径为 `{workdir}/step_{n}.{ext}`，作为产物上报。
//! 非零退出码视为步骤失败，错误中带 stderr。

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::AgentError;
use crate::llm::{ask, LlmReply};
use crate::react::prompts;
use crate::react::Artifact;
use crate::sandbox::shell_quote;
use crate::tools::{ExecutorKind, StepExecutor, StepInput, StepOutput, TaskContext};

/// 支持的语言：(解释器, 扩展名)
fn interpreter_for(language: &str) -> Option<(&'static str, &'static str)> {
    match language.trim().to_lowercase().as_str() {
        "python" | "python3" | "py" => Some(("python3", "py")),
        "sh" | "bash" | "shell" => Some(("sh", "sh")),
        "javascript" | "js" | "node" => Some(("node", "js")),
        _ => None,
    }
}

/// 从文本中取第一个 ``` 代码块：(语言标记, 代码)
fn fenced_code(text: &str) -> Option<(String, String)> {
    let start = text.find("```")?;
    let rest = &text[start + 3..];
    let newline = rest.find('\n')?;
    let lang = rest[..newline].trim().to_string();
    let body = &rest[newline + 1..];
    let end = body.find("```").unwrap_or(body.len());
    Some((lang, body[..end].trim_end().to_string()))
}

fn program_from_reply(reply: &LlmReply) -> Result<(String, String), AgentError> {
    match reply {
        LlmReply::Structured(v) => {
            let code = v
                .get("code")
                .and_then(Value::as_str)
                .ok_or_else(|| AgentError::JsonParseError("program reply has no code".to_string()))?;
            let language = v.get("language").and_then(Value::as_str).unwrap_or("python");
            Ok((language.to_string(), code.to_string()))
        }
        LlmReply::Text(t) => match fenced_code(t) {
            Some((lang, code)) => Ok((if lang.is_empty() { "python".to_string() } else { lang }, code)),
            None => Err(AgentError::JsonParseError(
                "program reply is neither JSON nor a code block".to_string(),
            )),
        },
    }
}

#[derive(Debug, Default)]
pub struct CodeExecutor;

impl CodeExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StepExecutor for CodeExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::CodeExecution
    }

    async fn execute(&self, input: &StepInput<'_>, ctx: &TaskContext) -> Result<StepOutput, AgentError> {
        let (language, code) = match input.step.param_str("code") {
            Some(code) => (
                input.step.param_str("language").unwrap_or("python").to_string(),
                code.to_string(),
            ),
            None => {
                let reply = ask(ctx.llm(), &prompts::code_system(), &input.describe(), &[]).await?;
                program_from_reply(&reply)?
            }
        };
        let (interpreter, ext) = interpreter_for(&language)
            .ok_or_else(|| AgentError::StepFailed(format!("unsupported language: {}", language)))?;

        let sandbox = ctx.sandbox().await?;
        let workdir = ctx.workdir();
        let script = format!("{}/step_{}.{}", workdir.trim_end_matches('/'), input.index + 1, ext);
        ctx.sandboxes().write_file(&sandbox, &script, &code).await?;

        let command = format!(
            "cd {} && {} {}",
            shell_quote(workdir),
            interpreter,
            shell_quote(&script)
        );
        let out = ctx.sandboxes().exec(&sandbox, &command).await?;
        tracing::debug!(step = input.index, exit_code = out.exit_code, "program finished");
        if !out.success() {
            return Err(AgentError::StepFailed(format!(
                "{} exited with {}: {}",
                script,
                out.exit_code,
                out.stderr.trim()
            )));
        }

        Ok(StepOutput::new(json!({
            "language": language,
            "stdout": out.stdout,
            "stderr": out.stderr,
            "exitCode": out.exit_code,
        }))
        .with_artifacts(vec![Artifact::inline(script, code)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpreters() {
        assert_eq!(interpreter_for("Python"), Some(("python3", "py")));
        assert_eq!(interpreter_for("bash"), Some(("sh", "sh")));
        assert_eq!(interpreter_for("node"), Some(("node", "js")));
        assert_eq!(interpreter_for("cobol"), None);
    }

    #[test]
    fn test_program_from_text_block() {
        let reply = LlmReply::Text("Here:\n```sh\necho hi\n```".to_string());
        let (lang, code) = program_from_reply(&reply).unwrap();
        assert_eq!(lang, "sh");
        assert_eq!(code, "echo hi");
    }
}
