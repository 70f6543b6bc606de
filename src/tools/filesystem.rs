//! fileSystem 执行器：在沙箱内按动作队列读写文件
//!
//! 动作来自步骤 params.actions，或由模型把步骤描述翻译成动作列表。
//! 显式有界循环：最多执行 MAX_ACTIONS 个动作、向模型要动作最多 MAX_ROUNDS 轮；
//! 单个动作失败记录后继续，全部失败时整步失败。写入的文件作为产物上报。

use std::collections::VecDeque;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::AgentError;
use crate::llm::{ask, LlmReply};
use crate::react::prompts;
use crate::react::Artifact;
use crate::sandbox::SandboxError;
use crate::tools::{ExecutorKind, StepExecutor, StepInput, StepOutput, TaskContext};

const MAX_ACTIONS: usize = 16;
const MAX_ROUNDS: usize = 3;
/// 产物内联内容的上限
const INLINE_ARTIFACT_CHARS: usize = 4096;
/// 日志里读取结果的预览长度
const READ_PREVIEW_CHARS: usize = 2000;

/// 单个文件动作
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum FileAction {
    Write {
        path: String,
        #[serde(default)]
        content: String,
    },
    Append {
        path: String,
        #[serde(default)]
        content: String,
    },
    Read {
        path: String,
    },
    Mkdir {
        path: String,
    },
    List {
        #[serde(default)]
        path: String,
    },
    Delete {
        path: String,
    },
}

impl FileAction {
    fn op(&self) -> &'static str {
        match self {
            FileAction::Write { .. } => "write",
            FileAction::Append { .. } => "append",
            FileAction::Read { .. } => "read",
            FileAction::Mkdir { .. } => "mkdir",
            FileAction::List { .. } => "list",
            FileAction::Delete { .. } => "delete",
        }
    }

    fn path(&self) -> &str {
        match self {
            FileAction::Write { path, .. }
            | FileAction::Append { path, .. }
            | FileAction::Read { path }
            | FileAction::Mkdir { path }
            | FileAction::List { path }
            | FileAction::Delete { path } => path,
        }
    }
}

/// 解析动作数组；无法识别的条目跳过
pub fn parse_actions(v: &Value) -> Vec<FileAction> {
    let items = match v {
        Value::Array(items) => items.as_slice(),
        _ => return Vec::new(),
    };
    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<FileAction>(item.clone()) {
            Ok(a) => Some(a),
            Err(e) => {
                tracing::warn!(error = %e, item = %item, "skipping malformed file action");
                None
            }
        })
        .collect()
}

/// 模型回复 → (动作, 是否完成)
fn actions_from_reply(reply: &LlmReply) -> Result<(Vec<FileAction>, bool), AgentError> {
    match reply {
        LlmReply::Structured(v @ Value::Array(_)) => Ok((parse_actions(v), true)),
        LlmReply::Structured(v) => {
            let actions = v.get("actions").map(parse_actions).unwrap_or_default();
            let done = v.get("done").and_then(Value::as_bool).unwrap_or(true);
            Ok((actions, done))
        }
        LlmReply::Text(t) => Err(AgentError::JsonParseError(format!(
            "file actions expected as JSON, got: {}",
            t.chars().take(200).collect::<String>()
        ))),
    }
}

#[derive(Debug, Default)]
pub struct FileSystemExecutor;

impl FileSystemExecutor {
    pub fn new() -> Self {
        Self
    }

    async fn request_actions(
        &self,
        input: &StepInput<'_>,
        ctx: &TaskContext,
        log: &[Value],
    ) -> Result<(Vec<FileAction>, bool), AgentError> {
        let mut prompt = input.describe();
        if !log.is_empty() {
            prompt.push_str(&format!(
                "\n\nActions already performed and their results:\n{}",
                serde_json::to_string_pretty(log).unwrap_or_default()
            ));
        }
        let reply = ask(
            ctx.llm(),
            &prompts::file_ops_system(ctx.workdir()),
            &prompt,
            &[],
        )
        .await?;
        actions_from_reply(&reply)
    }

    /// 执行一个动作，返回结果描述；写入类动作同时返回产物
    async fn apply(
        &self,
        action: &FileAction,
        sandbox: &str,
        ctx: &TaskContext,
    ) -> Result<(Value, Option<Artifact>), SandboxError> {
        let mgr = ctx.sandboxes();
        let path = if action.path().is_empty() {
            ctx.workdir().to_string()
        } else {
            ctx.resolve_path(action.path())
        };
        match action {
            FileAction::Write { content, .. } => {
                mgr.write_file(sandbox, &path, content).await?;
                Ok((json!({"bytes": content.len()}), Some(artifact(&path, content))))
            }
            FileAction::Append { content, .. } => {
                let existing = match mgr.read_file(sandbox, &path).await {
                    Ok(s) => s,
                    Err(SandboxError::NotFound { .. }) => String::new(),
                    Err(e) => return Err(e),
                };
                let combined = existing + content;
                mgr.write_file(sandbox, &path, &combined).await?;
                Ok((json!({"bytes": combined.len()}), Some(artifact(&path, &combined))))
            }
            FileAction::Read { .. } => {
                let content = mgr.read_file(sandbox, &path).await?;
                let shown: String = content.chars().take(READ_PREVIEW_CHARS).collect();
                Ok((json!({"content": shown, "bytes": content.len()}), None))
            }
            FileAction::Mkdir { .. } => {
                mgr.mkdir(sandbox, &path).await?;
                Ok((json!({"created": true}), None))
            }
            FileAction::List { .. } => {
                let entries = mgr.list_dir(sandbox, &path).await?;
                Ok((json!({"entries": entries}), None))
            }
            FileAction::Delete { .. } => {
                mgr.remove_path(sandbox, &path).await?;
                Ok((json!({"deleted": true}), None))
            }
        }
    }
}

fn artifact(path: &str, content: &str) -> Artifact {
    if content.chars().count() <= INLINE_ARTIFACT_CHARS {
        Artifact::inline(path, content)
    } else {
        Artifact::path(path)
    }
}

#[async_trait]
impl StepExecutor for FileSystemExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::FileSystem
    }

    async fn execute(&self, input: &StepInput<'_>, ctx: &TaskContext) -> Result<StepOutput, AgentError> {
        let mut log: Vec<Value> = Vec::new();
        let mut queue: VecDeque<FileAction> = VecDeque::new();
        let mut rounds = 0;
        let mut more = false;

        match input.step.params.get("actions") {
            Some(actions) => queue.extend(parse_actions(actions)),
            None => {
                let (actions, done) = self.request_actions(input, ctx, &log).await?;
                rounds = 1;
                more = !done;
                queue.extend(actions);
            }
        }
        if queue.is_empty() {
            return Err(AgentError::StepFailed("no file actions to perform".to_string()));
        }

        let sandbox = ctx.sandbox().await?;
        let mut artifacts: Vec<Artifact> = Vec::new();
        let mut executed = 0;
        let mut failed = 0;

        loop {
            while let Some(action) = queue.pop_front() {
                if executed >= MAX_ACTIONS {
                    tracing::warn!(
                        step = input.index,
                        dropped = queue.len() + 1,
                        "file action limit reached, dropping remaining actions"
                    );
                    queue.clear();
                    break;
                }
                executed += 1;
                match self.apply(&action, &sandbox, ctx).await {
                    Ok((result, art)) => {
                        log.push(json!({"op": action.op(), "path": action.path(), "ok": true, "result": result}));
                        if let Some(a) = art {
                            artifacts.retain(|x| x.path != a.path);
                            artifacts.push(a);
                        }
                    }
                    Err(e) => {
                        failed += 1;
                        tracing::warn!(step = input.index, op = action.op(), path = action.path(), error = %e, "file action failed");
                        log.push(json!({"op": action.op(), "path": action.path(), "ok": false, "error": e.to_string()}));
                    }
                }
            }

            if !more || rounds >= MAX_ROUNDS || executed >= MAX_ACTIONS {
                break;
            }
            let (actions, done) = self.request_actions(input, ctx, &log).await?;
            rounds += 1;
            more = !done;
            if actions.is_empty() {
                break;
            }
            queue.extend(actions);
        }

        if failed == executed {
            let errors: Vec<String> = log
                .iter()
                .filter_map(|l| l.get("error").and_then(Value::as_str).map(str::to_string))
                .collect();
            return Err(AgentError::StepFailed(format!(
                "all {} file actions failed: {}",
                failed,
                errors.join("; ")
            )));
        }

        Ok(StepOutput::new(json!({
            "actions": log,
            "succeeded": executed - failed,
            "failed": failed,
        }))
        .with_artifacts(artifacts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_actions_skips_unknown_ops() {
        let actions = parse_actions(&json!([
            {"op": "write", "path": "a.txt", "content": "hi"},
            {"op": "chmod", "path": "a.txt"},
            {"op": "list"}
        ]));
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[1], FileAction::List { path: String::new() });
    }

    #[test]
    fn test_actions_from_reply() {
        let (acts, done) = actions_from_reply(&LlmReply::Structured(json!({
            "actions": [{"op": "mkdir", "path": "out"}],
            "done": false
        })))
        .unwrap();
        assert_eq!(acts.len(), 1);
        assert!(!done);
        assert!(actions_from_reply(&LlmReply::Text("sure!".into())).is_err());
    }
}
