//! 步骤分发器
//!
//! 按 action 名找到执行器，在超时内执行，结果统一转为 StepResult（失败时带错误标记，不向上抛）；
//! 每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::AgentError;
use crate::react::StepResult;
use crate::tools::{ExecutorKind, ExecutorRegistry, StepInput, TaskContext};

pub struct StepDispatcher {
    registry: ExecutorRegistry,
    timeout: Duration,
}

impl StepDispatcher {
    pub fn new(registry: ExecutorRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// 执行一步；总是返回 StepResult
    pub async fn dispatch(&self, input: &StepInput<'_>, ctx: &TaskContext) -> StepResult {
        let action = input.step.action.as_str();
        let intent = input.step.intent.clone();
        let kind = ExecutorKind::parse(action);
        let executor = match self.registry.get(kind) {
            Some(e) => e,
            None => {
                tracing::warn!(step = input.index, action, "unknown executor, recording placeholder");
                return StepResult::placeholder(action, intent);
            }
        };

        let start = Instant::now();
        let result = timeout(self.timeout, executor.execute(input, ctx)).await;

        let outcome = match &result {
            Ok(Ok(_)) => "ok",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "step_audit",
            "task_id": ctx.task_id(),
            "step": input.index,
            "executor": kind.as_str(),
            "ok": outcome == "ok",
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "params_preview": params_preview(&input.step.params),
        });
        tracing::info!(audit = %audit.to_string(), "step");

        match result {
            Ok(Ok(out)) => StepResult::ok(kind.as_str(), intent, out.output).with_artifacts(out.artifacts),
            Ok(Err(e)) => {
                tracing::warn!(step = input.index, executor = kind.as_str(), error = %e, "step failed");
                StepResult::error(kind.as_str(), intent, e.to_string())
            }
            Err(_) => {
                let e = AgentError::StepTimeout(format!(
                    "{} exceeded {}s",
                    kind.as_str(),
                    self.timeout.as_secs()
                ));
                tracing::warn!(step = input.index, error = %e, "step timed out");
                StepResult::error(kind.as_str(), intent, e.to_string())
            }
        }
    }
}

fn params_preview(params: &serde_json::Value) -> String {
    if params.is_null() {
        return String::new();
    }
    let s = params.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
