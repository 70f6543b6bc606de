//! Critic：每步执行后的反思，判断剩余计划是否仍然合适
//!
//! 可配置为只反思特定执行器的结果（减少 token 开销），其余返回 Skipped。
//! 回复为 `{"changePlan": bool, "reason": "..."}`，或以 OK / CONTINUE / CHANGE 开头的文本。

use std::collections::HashSet;
use std::sync::Arc;

use crate::core::AgentError;
use crate::llm::{ask, LlmClient, LlmReply};
use crate::react::plan::{preview, Plan};
use crate::react::prompts;
use crate::react::StepResult;

/// 反思结果
#[derive(Debug, Clone, PartialEq)]
pub enum Reflection {
    Continue,
    /// 需要修改计划，附原因
    ChangePlan(String),
    /// 该执行器不在反思范围内
    Skipped,
}

pub struct Critic {
    llm: Arc<dyn LlmClient>,
    /// 为空表示反思所有执行器
    evaluate_executors: HashSet<String>,
}

impl Critic {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            evaluate_executors: HashSet::new(),
        }
    }

    /// 只反思这些执行器的结果
    pub fn with_evaluate_executors(mut self, executors: Vec<String>) -> Self {
        self.evaluate_executors = executors.into_iter().collect();
        self
    }

    fn should_evaluate(&self, executor: &str) -> bool {
        self.evaluate_executors.is_empty() || self.evaluate_executors.contains(executor)
    }

    pub async fn reflect(
        &self,
        task: &str,
        plan: &Plan,
        index: usize,
        result: &StepResult,
    ) -> Result<Reflection, AgentError> {
        if !self.should_evaluate(&result.executor) {
            return Ok(Reflection::Skipped);
        }
        let prompt = format!(
            "Task: {}\n\nPlan:\n{}\n\nStep {} ({}) {}:\n{}",
            task,
            plan.render(index + 1),
            index + 1,
            result.executor,
            if result.is_error { "FAILED" } else { "finished" },
            preview(&result.output_text(), 4000)
        );
        let reply = ask(self.llm.as_ref(), &prompts::reflection_system(), &prompt, &[]).await?;
        Ok(parse_reflection(&reply))
    }
}

/// 无法识别的回复按「继续」处理
pub fn parse_reflection(reply: &LlmReply) -> Reflection {
    match reply {
        LlmReply::Structured(v) => {
            let change = v
                .get("changePlan")
                .or_else(|| v.get("change_plan"))
                .and_then(|c| c.as_bool())
                .unwrap_or(false);
            if change {
                let reason = v
                    .get("reason")
                    .and_then(|r| r.as_str())
                    .unwrap_or("plan no longer fits")
                    .to_string();
                Reflection::ChangePlan(reason)
            } else {
                Reflection::Continue
            }
        }
        LlmReply::Text(t) => {
            let upper = t.trim().to_uppercase();
            if upper.starts_with("CHANGE") {
                let reason = t
                    .trim()
                    .get("CHANGE".len()..)
                    .unwrap_or("")
                    .trim_start_matches([':', ' ', '-'])
                    .trim()
                    .to_string();
                Reflection::ChangePlan(if reason.is_empty() {
                    "plan no longer fits".to_string()
                } else {
                    reason
                })
            } else {
                Reflection::Continue
            }
        }
    }
}
