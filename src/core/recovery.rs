//! 错误恢复引擎
//!
//! 根据出错阶段返回 RecoveryAction：只有初始计划失败会终止任务，其余阶段的失败都被吸收。

use crate::core::error::Phase;
use crate::core::{AgentError, RecoveryAction};
use crate::react::ExecutionTrace;

/// 阶段化的错误恢复：单步失败永远不会中止整个任务
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, phase: Phase, err: &AgentError) -> RecoveryAction {
        match phase {
            Phase::InitialPlan => RecoveryAction::Abort,
            Phase::Reflection | Phase::Replan => {
                if err.is_timeout() {
                    tracing::warn!(error = %err, "progress check timed out, assuming no change");
                }
                RecoveryAction::AssumeNoChange
            }
            Phase::Synthesis => RecoveryAction::FallbackAnswer,
            Phase::Refine => RecoveryAction::RecordAndContinue,
        }
    }

    /// 汇总失败时的兜底回答：说明已完成步骤与遇到的错误
    pub fn fallback_answer(&self, task: &str, trace: &ExecutionTrace, err: &AgentError) -> String {
        let failed: Vec<String> = trace
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_error)
            .map(|(i, r)| format!("step {} ({}): {}", i + 1, r.executor, r.output_text()))
            .collect();
        let mut out = format!(
            "Task completed with errors: \"{}\". {} step(s) ran, {} failed. Final synthesis failed: {}.",
            task,
            trace.len(),
            failed.len(),
            err
        );
        if !failed.is_empty() {
            out.push_str("\nFailures:\n");
            for f in failed {
                out.push_str("- ");
                out.push_str(&f);
                out.push('\n');
            }
        }
        if let Some(last) = trace.iter().rev().find(|r| !r.is_error) {
            out.push_str("\nLast successful output:\n");
            out.push_str(&last.output_text());
        }
        out
    }
}
