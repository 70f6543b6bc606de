//! Planner：初始规划、步骤细化、重规划与最终汇总
//!
//! 调用 LLM 得到回复后交给 parse_plan 解析；超时由主循环在外层控制。

use std::sync::Arc;

use crate::core::AgentError;
use crate::llm::{ask, LlmClient, LlmReply};
use crate::memory::Message;
use crate::react::plan::{parse_plan, Plan, PlannerOutput, Step};
use crate::react::prompts;
use crate::react::ExecutionTrace;

/// 提示词中每条前序结果的最大字符数
const RESULT_PREVIEW_CHARS: usize = 4000;

pub struct Planner {
    llm: Arc<dyn LlmClient>,
    workdir: String,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, workdir: impl Into<String>) -> Self {
        Self {
            llm,
            workdir: workdir.into(),
        }
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 初始规划；external_tools 为已发现外部能力的文本清单
    pub async fn plan(
        &self,
        task: &str,
        history: &[Message],
        external_tools: &str,
    ) -> Result<PlannerOutput, AgentError> {
        let system = prompts::planner_system(&self.workdir, external_tools);
        let reply = ask(self.llm.as_ref(), &system, task, history).await?;
        parse_plan(&reply)
    }

    /// 结合前序结果细化某一步的执行指令
    pub async fn refine(&self, task: &str, step: &Step, prior: &str) -> Result<String, AgentError> {
        let prompt = format!(
            "Task: {}\n\nNext step: {}\nExecutor: {}\nExpected output: {}\n\nResults of earlier steps:\n{}",
            task, step.intent, step.action, step.expected_output, prior
        );
        let reply = ask(self.llm.as_ref(), &prompts::refine_system(), &prompt, &[]).await?;
        Ok(reply.to_text())
    }

    /// 重规划：返回完整的新计划（已完成的步骤也在其中）
    pub async fn replan(
        &self,
        task: &str,
        plan: &Plan,
        trace: &ExecutionTrace,
        completed: usize,
        reason: &str,
    ) -> Result<Plan, AgentError> {
        let prompt = format!(
            "Task: {}\n\nCurrent plan:\n{}\n\nSteps completed so far: {}\n\nResults:\n{}\n\nWhy the plan should change: {}",
            task,
            serde_json::to_string_pretty(&plan.to_json()).unwrap_or_default(),
            completed,
            trace.render(RESULT_PREVIEW_CHARS),
            reason
        );
        let reply = ask(self.llm.as_ref(), &prompts::replan_system(), &prompt, &[]).await?;
        match parse_plan(&reply)? {
            PlannerOutput::Plan(p) => Ok(p),
            PlannerOutput::DirectAnswer(_) => Err(AgentError::Planning(
                "replan returned a direct answer instead of a plan".to_string(),
            )),
        }
    }

    /// 从完整轨迹汇总最终回答
    pub async fn synthesize(
        &self,
        task: &str,
        trace: &ExecutionTrace,
        history: &[Message],
    ) -> Result<String, AgentError> {
        let artifacts: Vec<String> = trace.artifacts().into_iter().map(|a| a.path).collect();
        let prompt = format!(
            "Task: {}\n\nStep results:\n{}\n\nFiles produced: {}",
            task,
            trace.render(RESULT_PREVIEW_CHARS),
            if artifacts.is_empty() {
                "(none)".to_string()
            } else {
                artifacts.join(", ")
            }
        );
        let reply = ask(self.llm.as_ref(), &prompts::synthesis_system(), &prompt, history).await?;
        let text = match &reply {
            LlmReply::Structured(v) => v
                .get("answer")
                .and_then(|a| a.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| reply.to_text()),
            LlmReply::Text(t) => t.clone(),
        };
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::react::prompts::{PLANNER_MARKER, REPLAN_MARKER, SYNTHESIS_MARKER};
    use crate::react::StepResult;

    #[tokio::test]
    async fn test_plan_parses_steps() {
        let llm = MockLlmClient::new().on(
            PLANNER_MARKER,
            r#"{"step1": {"step": "write", "action": "fileSystem", "expectedOutput": "file", "usingData": "none"}}"#,
        );
        let planner = Planner::new(Arc::new(llm), "/workspace");
        match planner.plan("make a file", &[], "").await.unwrap() {
            PlannerOutput::Plan(p) => assert_eq!(p.get(0).unwrap().action, "fileSystem"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_replan_rejects_direct_answer() {
        let llm = MockLlmClient::new().on(REPLAN_MARKER, r#"{"directAnswer": true, "answer": "x"}"#);
        let planner = Planner::new(Arc::new(llm), "/workspace");
        let plan = Plan::new(vec![Step::new("a", "generation")]);
        let err = planner
            .replan("t", &plan, &ExecutionTrace::new(), 1, "because")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Planning(_)));
    }

    #[tokio::test]
    async fn test_synthesize_accepts_answer_field() {
        let llm = MockLlmClient::new().on(SYNTHESIS_MARKER, r#"{"answer": "all done"}"#);
        let planner = Planner::new(Arc::new(llm), "/workspace");
        let mut trace = ExecutionTrace::new();
        trace.push(StepResult::ok("generation", "draft", serde_json::json!("text")));
        assert_eq!(planner.synthesize("t", &trace, &[]).await.unwrap(), "all done");
    }
}
