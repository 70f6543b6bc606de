//! 计划执行主循环
//!
//! 对计划中的每一步：执行前记录推理（可选地结合前序结果细化指令）→ 分发执行 → 追加 StepResult → 执行后反思。
//! 反思认为计划不再合适时，只在 ReplanPolicy 允许的位置重规划；新计划整体替换旧计划，游标继续向后。
//! 单步失败、反思失败、重规划失败都被吸收，循环不会因此中止。

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::core::error::Phase;
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::memory::{ReasoningRecord, ReasoningStore};
use crate::react::plan::preview;
use crate::react::{
    Critic, ExecutionTrace, Plan, Planner, ReasoningEntry, ReasoningPhase, Reflection, TaskEvent,
};
use crate::tools::{StepDispatcher, StepInput, TaskContext};

/// 交给执行器的前序结果，每条最多保留的字符数
const PRIOR_PREVIEW_CHARS: usize = 4000;
/// 事件与推理记录中的预览长度
const EVENT_PREVIEW_CHARS: usize = 200;
const THOUGHT_PREVIEW_CHARS: usize = 800;

pub type EventSender = mpsc::UnboundedSender<TaskEvent>;

/// 重规划节奏：完成的步骤下标 index 满足 `index >= min_completed && index % every == 0` 时才允许
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplanPolicy {
    pub min_completed: usize,
    /// 0 表示禁止重规划
    pub every: usize,
}

impl Default for ReplanPolicy {
    fn default() -> Self {
        Self {
            min_completed: 2,
            every: 3,
        }
    }
}

impl ReplanPolicy {
    pub fn allows(&self, index: usize) -> bool {
        self.every > 0 && index >= self.min_completed && index % self.every == 0
    }
}

/// 主循环参数
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub replan: ReplanPolicy,
    /// 反思、重规划、细化各自的超时
    pub progress_timeout: Duration,
    pub refine_steps: bool,
    /// 每 N 步持久化一次推理记录；0 表示只在结束时
    pub persist_every: usize,
    /// 重规划后的计划同样受此上限约束
    pub max_steps: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            replan: ReplanPolicy::default(),
            progress_timeout: Duration::from_secs(30),
            refine_steps: true,
            persist_every: 3,
            max_steps: 20,
        }
    }
}

/// 主循环结束时的状态
#[derive(Debug)]
pub struct LoopOutcome {
    /// 最终生效的计划（可能已被替换）
    pub plan: Plan,
    pub trace: ExecutionTrace,
    pub reasoning: Vec<ReasoningEntry>,
    pub replans: usize,
}

/// 在时限内等待；超时转为 AgentError::Timeout
pub async fn with_timeout<T, F>(what: &str, limit: Duration, fut: F) -> Result<T, AgentError>
where
    F: Future<Output = Result<T, AgentError>>,
{
    match timeout(limit, fut).await {
        Ok(r) => r,
        Err(_) => Err(AgentError::Timeout {
            what: what.to_string(),
            secs: limit.as_secs(),
        }),
    }
}

pub fn send_event(tx: Option<&EventSender>, ev: TaskEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

/// 推理记录落盘点：每次写出完整记录，失败只记日志
pub struct ReasoningCheckpoint<'a> {
    pub store: &'a dyn ReasoningStore,
    pub task_id: &'a str,
    pub user_id: &'a str,
    pub session_id: &'a str,
}

impl ReasoningCheckpoint<'_> {
    pub async fn save(&self, entries: &[ReasoningEntry], complete: bool) {
        let record = ReasoningRecord {
            task_id: self.task_id.to_string(),
            user_id: self.user_id.to_string(),
            session_id: self.session_id.to_string(),
            complete,
            entries: entries.to_vec(),
        };
        if let Err(e) = self.store.save(&record).await {
            tracing::warn!(task_id = self.task_id, error = %e, "failed to persist reasoning");
        }
    }
}

/// 单个任务的计划执行循环
pub struct PlanLoop<'a> {
    pub planner: &'a Planner,
    pub critic: &'a Critic,
    pub dispatcher: &'a StepDispatcher,
    pub recovery: &'a RecoveryEngine,
    pub settings: &'a LoopSettings,
    pub event_tx: Option<&'a EventSender>,
    pub checkpoint: Option<&'a ReasoningCheckpoint<'a>>,
}

impl<'a> PlanLoop<'a> {
    pub fn new(
        planner: &'a Planner,
        critic: &'a Critic,
        dispatcher: &'a StepDispatcher,
        recovery: &'a RecoveryEngine,
        settings: &'a LoopSettings,
    ) -> Self {
        Self {
            planner,
            critic,
            dispatcher,
            recovery,
            settings,
            event_tx: None,
            checkpoint: None,
        }
    }

    pub fn with_event_tx(mut self, tx: Option<&'a EventSender>) -> Self {
        self.event_tx = tx;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: &'a ReasoningCheckpoint<'a>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub async fn run(&self, task: &str, plan: Plan, ctx: &TaskContext) -> LoopOutcome {
        let mut plan = plan;
        let mut trace = ExecutionTrace::new();
        let mut reasoning: Vec<ReasoningEntry> = Vec::new();
        let mut replans = 0;
        let mut index = 0;

        while let Some(step) = plan.get(index).cloned() {
            send_event(
                self.event_tx,
                TaskEvent::StepStarted {
                    index,
                    executor: step.action.clone(),
                    intent: step.intent.clone(),
                },
            );

            // 执行前：按 usingData 选出前序结果，可选细化指令
            let prior = trace.render_selected(&step.using_data, PRIOR_PREVIEW_CHARS);
            let dispatch_action = format!("dispatch {}", step.action);
            let instruction = if self.settings.refine_steps && !prior.is_empty() {
                let refined = with_timeout(
                    "refine",
                    self.settings.progress_timeout,
                    self.planner.refine(task, &step, &prior),
                )
                .await;
                match refined {
                    Ok(text) => {
                        reasoning.push(ReasoningEntry::new(
                            Some(index),
                            ReasoningPhase::PreStep,
                            preview(&text, THOUGHT_PREVIEW_CHARS),
                            dispatch_action.clone(),
                        ));
                        Some(text)
                    }
                    Err(e) => {
                        let action = self.recovery.handle(Phase::Refine, &e);
                        tracing::warn!(step = index, error = %e, ?action, "refinement failed, using plan step as is");
                        reasoning.push(
                            ReasoningEntry::new(
                                Some(index),
                                ReasoningPhase::PreStep,
                                format!("refinement failed: {}", e),
                                dispatch_action.clone(),
                            )
                            .failed(),
                        );
                        None
                    }
                }
            } else {
                reasoning.push(ReasoningEntry::new(
                    Some(index),
                    ReasoningPhase::PreStep,
                    step.intent.clone(),
                    dispatch_action.clone(),
                ));
                None
            };

            let input = StepInput {
                index,
                task,
                step: &step,
                instruction,
                prior,
            };
            let result = self.dispatcher.dispatch(&input, ctx).await;
            send_event(
                self.event_tx,
                TaskEvent::StepFinished {
                    index,
                    executor: result.executor.clone(),
                    is_error: result.is_error,
                    preview: preview(&result.output_text(), EVENT_PREVIEW_CHARS),
                },
            );
            trace.push(result);

            // 执行后：反思
            if let Some(last) = trace.get(index) {
                let reflected = with_timeout(
                    "reflection",
                    self.settings.progress_timeout,
                    self.critic.reflect(task, &plan, index, last),
                )
                .await;
                match reflected {
                    Ok(Reflection::Continue) => {
                        reasoning.push(ReasoningEntry::new(
                            Some(index),
                            ReasoningPhase::PostStep,
                            "plan still fits",
                            "continue",
                        ));
                        send_event(
                            self.event_tx,
                            TaskEvent::Reflection {
                                index,
                                change_plan: false,
                                reason: String::new(),
                            },
                        );
                    }
                    Ok(Reflection::ChangePlan(reason)) => {
                        reasoning.push(ReasoningEntry::new(
                            Some(index),
                            ReasoningPhase::PostStep,
                            reason.clone(),
                            "change plan",
                        ));
                        send_event(
                            self.event_tx,
                            TaskEvent::Reflection {
                                index,
                                change_plan: true,
                                reason: reason.clone(),
                            },
                        );
                        if self.settings.replan.allows(index) {
                            if let Some(new_plan) =
                                self.replan(task, &plan, &trace, index, &reason, &mut reasoning).await
                            {
                                plan = new_plan;
                                replans += 1;
                            }
                        } else {
                            tracing::debug!(step = index, "replan requested outside the allowed cadence, keeping plan");
                        }
                    }
                    Ok(Reflection::Skipped) => {
                        reasoning.push(ReasoningEntry::new(
                            Some(index),
                            ReasoningPhase::PostStep,
                            format!("reflection skipped for {}", last.executor),
                            "continue",
                        ));
                    }
                    Err(e) => {
                        if self.recovery.handle(Phase::Reflection, &e) == RecoveryAction::AssumeNoChange {
                            tracing::warn!(step = index, error = %e, "reflection failed, assuming the plan still fits");
                        }
                        reasoning.push(
                            ReasoningEntry::new(
                                Some(index),
                                ReasoningPhase::PostStep,
                                format!("reflection failed: {}", e),
                                "continue",
                            )
                            .failed(),
                        );
                    }
                }
            }

            index += 1;
            if let Some(cp) = self.checkpoint {
                let every = self.settings.persist_every;
                if every > 0 && index % every == 0 {
                    cp.save(&reasoning, false).await;
                }
            }
        }

        LoopOutcome {
            plan,
            trace,
            reasoning,
            replans,
        }
    }

    /// 重规划；失败或超时返回 None（视为无变化）
    async fn replan(
        &self,
        task: &str,
        plan: &Plan,
        trace: &ExecutionTrace,
        index: usize,
        reason: &str,
        reasoning: &mut Vec<ReasoningEntry>,
    ) -> Option<Plan> {
        let replanned = with_timeout(
            "replan",
            self.settings.progress_timeout,
            self.planner.replan(task, plan, trace, index + 1, reason),
        )
        .await;
        match replanned {
            Ok(mut new_plan) => {
                let dropped = new_plan.truncate(self.settings.max_steps);
                if dropped > 0 {
                    tracing::warn!(dropped, max = self.settings.max_steps, "replanned steps over the limit were dropped");
                }
                tracing::info!(at = index, old = plan.len(), new = new_plan.len(), "plan replaced");
                reasoning.push(ReasoningEntry::new(
                    Some(index),
                    ReasoningPhase::Replan,
                    reason,
                    format!("replace plan with {} steps", new_plan.len()),
                ));
                send_event(
                    self.event_tx,
                    TaskEvent::Replanned {
                        at_index: index,
                        steps: new_plan.len(),
                    },
                );
                Some(new_plan)
            }
            Err(e) => {
                let action = self.recovery.handle(Phase::Replan, &e);
                tracing::warn!(step = index, error = %e, ?action, "replan failed, keeping current plan");
                reasoning.push(
                    ReasoningEntry::new(
                        Some(index),
                        ReasoningPhase::Replan,
                        format!("replan failed: {}", e),
                        "keep plan",
                    )
                    .failed(),
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::llm::MockLlmClient;
    use crate::memory::InMemoryReasoningStore;
    use crate::protocol::ToolProtocolClient;
    use crate::react::prompts::{GENERATION_MARKER, REFINE_MARKER, REFLECTION_MARKER, REPLAN_MARKER};
    use crate::react::{DataSelector, Step};
    use std::time::Instant;
    use crate::sandbox::{InMemoryRuntime, RetryPolicy, SandboxManager};
    use crate::tools::{ExecutorRegistry, GenerationExecutor};

    struct Fixture {
        llm: Arc<MockLlmClient>,
        planner: Planner,
        critic: Critic,
        dispatcher: StepDispatcher,
        recovery: RecoveryEngine,
        ctx: TaskContext,
    }

    fn fixture(llm: MockLlmClient) -> Fixture {
        let llm = Arc::new(llm);
        let mut registry = ExecutorRegistry::new();
        registry.register(GenerationExecutor::new());
        let sandboxes = Arc::new(SandboxManager::new(
            Arc::new(InMemoryRuntime::default()),
            RetryPolicy::default(),
            "loop",
            "/workspace",
        ));
        Fixture {
            planner: Planner::new(llm.clone(), "/workspace"),
            critic: Critic::new(llm.clone()),
            dispatcher: StepDispatcher::new(registry, 30),
            recovery: RecoveryEngine::new(),
            ctx: TaskContext::new(
                "task-loop",
                llm.clone(),
                sandboxes,
                Arc::new(ToolProtocolClient::default()),
            ),
            llm,
        }
    }

    fn generation_plan(n: usize) -> Plan {
        Plan::new((0..n).map(|i| Step::new(format!("part {}", i + 1), "generation")).collect())
    }

    #[test]
    fn test_replan_policy_cadence() {
        let p = ReplanPolicy::default();
        let allowed: Vec<usize> = (0..10).filter(|i| p.allows(*i)).collect();
        assert_eq!(allowed, vec![3, 6, 9]);
        assert!(!ReplanPolicy { min_completed: 0, every: 0 }.allows(0));
    }

    #[tokio::test]
    async fn test_replan_only_at_allowed_index() {
        let replanned = serde_json::json!({
            "step1": {"step": "a", "action": "generation", "usingData": "none"},
            "step2": {"step": "b", "action": "generation", "usingData": "none"},
            "step3": {"step": "c", "action": "generation", "usingData": "none"},
            "step4": {"step": "d", "action": "generation", "usingData": "none"},
            "step5": {"step": "e", "action": "generation", "usingData": "none"},
            "step6": {"step": "f", "action": "generation", "usingData": "none"}
        })
        .to_string();
        let f = fixture(
            MockLlmClient::new()
                .on(GENERATION_MARKER, "text")
                .on(REFLECTION_MARKER, r#"{"changePlan": true, "reason": "needs more"}"#)
                .on(REPLAN_MARKER, replanned),
        );
        let settings = LoopSettings::default();
        let outcome = PlanLoop::new(&f.planner, &f.critic, &f.dispatcher, &f.recovery, &settings)
            .run("write", generation_plan(4), &f.ctx)
            .await;

        assert_eq!(outcome.replans, 1);
        assert_eq!(f.llm.calls_matching(REPLAN_MARKER), 1);
        assert_eq!(outcome.plan.len(), 6);
        assert_eq!(outcome.trace.len(), 6);
        assert!(outcome
            .reasoning
            .iter()
            .any(|r| r.phase == ReasoningPhase::Replan && r.step_index == Some(3)));
    }

    #[tokio::test]
    async fn test_unknown_executor_and_failures_do_not_stop_loop() {
        let f = fixture(
            MockLlmClient::new()
                .fail_on(GENERATION_MARKER, "model down")
                .fail_on(REFLECTION_MARKER, "model down"),
        );
        let plan = Plan::new(vec![
            Step::new("teleport", "teleport"),
            Step::new("write", "generation"),
            Step::new("again", "generation"),
        ]);
        let settings = LoopSettings::default();
        let outcome = PlanLoop::new(&f.planner, &f.critic, &f.dispatcher, &f.recovery, &settings)
            .run("task", plan, &f.ctx)
            .await;

        assert_eq!(outcome.trace.len(), 3);
        assert!(!outcome.trace.get(0).unwrap().is_error);
        assert_eq!(outcome.trace.error_count(), 2);
        assert!(outcome.reasoning.iter().any(|r| r.is_error));
    }

    #[tokio::test]
    async fn test_refine_uses_selected_prior_results() {
        let f = fixture(
            MockLlmClient::new()
                .on(GENERATION_MARKER, "draft")
                .on(REFINE_MARKER, "use the draft")
                .on(REFLECTION_MARKER, "OK"),
        );
        let plan = Plan::new(vec![
            Step::new("draft", "generation"),
            Step::new("polish", "generation").using(DataSelector::Steps(vec![0])),
        ]);
        let settings = LoopSettings::default();
        let outcome = PlanLoop::new(&f.planner, &f.critic, &f.dispatcher, &f.recovery, &settings)
            .run("task", plan, &f.ctx)
            .await;

        assert_eq!(f.llm.calls_matching(REFINE_MARKER), 1);
        assert_eq!(outcome.reasoning[0].thought, "draft");
        assert!(outcome
            .reasoning
            .iter()
            .any(|r| r.phase == ReasoningPhase::PreStep && r.thought == "use the draft"));
    }

    #[tokio::test]
    async fn test_checkpoint_cadence() {
        let f = fixture(MockLlmClient::new().on(GENERATION_MARKER, "x").on(REFLECTION_MARKER, "OK"));
        let store = InMemoryReasoningStore::new();
        let cp = ReasoningCheckpoint {
            store: &store,
            task_id: "task-loop",
            user_id: "u",
            session_id: "s",
        };
        let settings = LoopSettings::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        PlanLoop::new(&f.planner, &f.critic, &f.dispatcher, &f.recovery, &settings)
            .with_event_tx(Some(&tx))
            .with_checkpoint(&cp)
            .run("task", generation_plan(7), &f.ctx)
            .await;

        assert_eq!(store.save_count("task-loop"), 2);
        assert!(!store.latest("task-loop").unwrap().complete);
        drop(tx);
        let mut started = 0;
        while let Some(ev) = rx.recv().await {
            if matches!(ev, TaskEvent::StepStarted { .. }) {
                started += 1;
            }
        }
        assert_eq!(started, 7);
    }

    #[tokio::test]
    async fn test_skipped_reflection_still_records_post_step() {
        let f = fixture(MockLlmClient::new().on(GENERATION_MARKER, "x"));
        let critic = Critic::new(f.llm.clone()).with_evaluate_executors(vec!["codeExecution".to_string()]);
        let settings = LoopSettings::default();
        let outcome = PlanLoop::new(&f.planner, &critic, &f.dispatcher, &f.recovery, &settings)
            .run("task", generation_plan(2), &f.ctx)
            .await;

        assert_eq!(f.llm.calls_matching(REFLECTION_MARKER), 0);
        let post: Vec<&ReasoningEntry> = outcome
            .reasoning
            .iter()
            .filter(|r| r.phase == ReasoningPhase::PostStep)
            .collect();
        assert_eq!(post.len(), 2);
        assert_eq!(post[0].thought, "reflection skipped for generation");
        assert_eq!(post[1].action, "continue");
        assert!(post.iter().all(|r| !r.is_error));
    }

    #[tokio::test]
    async fn test_reflection_timeout_keeps_plan() {
        let f = fixture(
            MockLlmClient::new()
                .on(GENERATION_MARKER, "x")
                .hang_on(REFLECTION_MARKER, Duration::from_secs(5)),
        );
        let settings = LoopSettings {
            progress_timeout: Duration::from_millis(50),
            ..LoopSettings::default()
        };
        let started = Instant::now();
        let outcome = PlanLoop::new(&f.planner, &f.critic, &f.dispatcher, &f.recovery, &settings)
            .run("task", generation_plan(4), &f.ctx)
            .await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(outcome.trace.len(), 4);
        assert_eq!(outcome.plan.len(), 4);
        assert_eq!(outcome.replans, 0);
        assert_eq!(f.llm.calls_matching(REPLAN_MARKER), 0);
        let timed_out: Vec<&ReasoningEntry> = outcome
            .reasoning
            .iter()
            .filter(|r| r.phase == ReasoningPhase::PostStep && r.is_error)
            .collect();
        assert_eq!(timed_out.len(), 4);
        assert!(timed_out[0].thought.contains("timed out"), "{}", timed_out[0].thought);
    }

    #[tokio::test]
    async fn test_replan_timeout_keeps_plan() {
        let f = fixture(
            MockLlmClient::new()
                .on(GENERATION_MARKER, "x")
                .on(REFLECTION_MARKER, r#"{"changePlan": true, "reason": "try again"}"#)
                .hang_on(REPLAN_MARKER, Duration::from_secs(5)),
        );
        let settings = LoopSettings {
            progress_timeout: Duration::from_millis(50),
            ..LoopSettings::default()
        };
        let outcome = PlanLoop::new(&f.planner, &f.critic, &f.dispatcher, &f.recovery, &settings)
            .run("task", generation_plan(4), &f.ctx)
            .await;

        assert_eq!(f.llm.calls_matching(REPLAN_MARKER), 1);
        assert_eq!(outcome.replans, 0);
        assert_eq!(outcome.plan.len(), 4);
        assert_eq!(outcome.plan.get(3).unwrap().intent, "part 4");
        assert_eq!(outcome.trace.len(), 4);
        let failed = outcome
            .reasoning
            .iter()
            .find(|r| r.phase == ReasoningPhase::Replan)
            .unwrap();
        assert!(failed.is_error);
        assert_eq!(failed.step_index, Some(3));
        assert_eq!(failed.action, "keep plan");
    }
}
