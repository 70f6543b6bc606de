//! 任务编排器：单个任务从规划到汇总的完整流程
//!
//! 初始规划（超时或失败对任务致命）→ directAnswer 直接返回 / 计划执行主循环 → 汇总最终回答（失败时使用兜底文案）。
//! 沙箱在执行器第一次需要时才创建，任务结束时无论成败都会销毁。
//! 每个任务拥有独立的 TaskContext；LLM、沙箱管理器、协议客户端在任务之间共享。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use uuid::Uuid;

use crate::config::{AppConfig, OrchestratorSection};
use crate::core::error::Phase;
use crate::core::{AgentError, RecoveryEngine};
use crate::llm::{create_llm_from_config, LlmClient};
use crate::memory::{
    recent_turns, JsonFileReasoningStore, Message, NoopReasoningStore, ReasoningStore,
    HISTORY_TURNS,
};
use crate::protocol::ToolProtocolClient;
use crate::react::{
    send_event, with_timeout, Artifact, Critic, EventSender, ExecutionTrace, LoopSettings, PlanLoop,
    Planner, PlannerOutput, ReasoningCheckpoint, ReasoningEntry, ReasoningPhase, ReplanPolicy,
    TaskEvent,
};
use crate::sandbox::SandboxManager;
use crate::tools::{default_registry, render_catalog, ExecutorRegistry, StepDispatcher, TaskContext};

/// 编排器参数（由 [orchestrator] 段转换而来）
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_steps: usize,
    pub plan_timeout: Duration,
    pub finalize_timeout: Duration,
    /// 单步执行超时
    pub step_timeout_secs: u64,
    /// 为空表示反思所有执行器
    pub reflect_executors: Vec<String>,
    pub loop_settings: LoopSettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_section(&OrchestratorSection::default(), 300)
    }
}

impl OrchestratorSettings {
    pub fn from_section(cfg: &OrchestratorSection, step_timeout_secs: u64) -> Self {
        Self {
            max_steps: cfg.max_steps,
            plan_timeout: Duration::from_secs(cfg.plan_timeout_secs),
            finalize_timeout: Duration::from_secs(cfg.finalize_timeout_secs),
            step_timeout_secs,
            reflect_executors: cfg.reflect_executors.clone(),
            loop_settings: LoopSettings {
                replan: ReplanPolicy {
                    min_completed: cfg.replan_min_completed,
                    every: cfg.replan_every,
                },
                progress_timeout: Duration::from_secs(cfg.progress_timeout_secs),
                refine_steps: cfg.refine_steps,
                persist_every: cfg.persist_every,
                max_steps: cfg.max_steps,
            },
        }
    }
}

/// 一次任务请求
#[derive(Debug, Clone, Default)]
pub struct TaskRequest {
    pub task: String,
    pub user_id: String,
    pub session_id: String,
    /// 调用方保存的对话历史，规划与汇总时携带
    pub history: Vec<Message>,
}

impl TaskRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }

    pub fn user(mut self, user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self.session_id = session_id.into();
        self
    }

    /// 携带调用方历史；只保留最近几轮
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = recent_turns(history, HISTORY_TURNS);
        self
    }
}

/// 任务的完整结果
#[derive(Debug)]
pub struct TaskReport {
    pub task_id: String,
    pub answer: String,
    pub trace: ExecutionTrace,
    pub reasoning: Vec<ReasoningEntry>,
    pub artifacts: Vec<Artifact>,
    /// 本任务使用过的沙箱（返回时已销毁）
    pub sandbox_id: Option<String>,
    pub replans: usize,
    /// 规划阶段直接给出了回答
    pub direct: bool,
}

pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    planner: Planner,
    critic: Critic,
    dispatcher: StepDispatcher,
    recovery: RecoveryEngine,
    sandboxes: Arc<SandboxManager>,
    protocol: Arc<ToolProtocolClient>,
    store: Arc<dyn ReasoningStore>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        sandboxes: Arc<SandboxManager>,
        protocol: Arc<ToolProtocolClient>,
        registry: ExecutorRegistry,
        settings: OrchestratorSettings,
    ) -> Self {
        let planner = Planner::new(llm.clone(), sandboxes.workdir());
        let critic = Critic::new(llm.clone()).with_evaluate_executors(settings.reflect_executors.clone());
        let dispatcher = StepDispatcher::new(registry, settings.step_timeout_secs);
        Self {
            llm,
            planner,
            critic,
            dispatcher,
            recovery: RecoveryEngine::new(),
            sandboxes,
            protocol,
            store: Arc::new(NoopReasoningStore),
            settings,
        }
    }

    /// 设置推理记录存储
    pub fn with_store(mut self, store: Arc<dyn ReasoningStore>) -> Self {
        self.store = store;
        self
    }

    pub fn sandboxes(&self) -> &Arc<SandboxManager> {
        &self.sandboxes
    }

    pub fn protocol(&self) -> &Arc<ToolProtocolClient> {
        &self.protocol
    }

    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.planner.token_usage()
    }

    /// 运行任务，只返回最终回答
    pub async fn run(&self, task: &str, user_id: &str, session_id: &str) -> Result<String, AgentError> {
        let req = TaskRequest::new(task).user(user_id, session_id);
        Ok(self.run_detailed(req, None).await?.answer)
    }

    /// 运行任务并返回完整结果；events 可选，用于推送进度
    pub async fn run_detailed(
        &self,
        req: TaskRequest,
        events: Option<&EventSender>,
    ) -> Result<TaskReport, AgentError> {
        let task_id = Uuid::new_v4().to_string();
        let ctx = TaskContext::new(
            task_id.clone(),
            self.llm.clone(),
            self.sandboxes.clone(),
            self.protocol.clone(),
        );
        tracing::info!(task_id = %task_id, user_id = %req.user_id, "task started");

        let result = self.drive(&req, &ctx, events).await;

        // 所有退出路径都销毁沙箱
        if let Some(destroyed) = ctx.release().await {
            tracing::info!(task_id = %task_id, destroyed, "task sandbox released");
        }
        match &result {
            Ok(report) => tracing::info!(
                task_id = %task_id,
                steps = report.trace.len(),
                errors = report.trace.error_count(),
                replans = report.replans,
                "task finished"
            ),
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "task failed");
                send_event(events, TaskEvent::Error { text: e.to_string() });
            }
        }
        result
    }

    async fn drive(
        &self,
        req: &TaskRequest,
        ctx: &TaskContext,
        events: Option<&EventSender>,
    ) -> Result<TaskReport, AgentError> {
        let task_id = ctx.task_id();
        let checkpoint = ReasoningCheckpoint {
            store: self.store.as_ref(),
            task_id,
            user_id: &req.user_id,
            session_id: &req.session_id,
        };

        let catalog = render_catalog(&self.protocol.all_capabilities().await);
        let planned = with_timeout(
            "initial plan",
            self.settings.plan_timeout,
            self.planner.plan(&req.task, &req.history, &catalog),
        )
        .await;
        let output = match planned {
            Ok(o) => o,
            Err(e) => {
                let action = self.recovery.handle(Phase::InitialPlan, &e);
                tracing::error!(task_id, error = %e, ?action, "initial planning failed");
                return Err(match e {
                    AgentError::Planning(_) => e,
                    other => AgentError::Planning(other.to_string()),
                });
            }
        };

        let mut plan = match output {
            PlannerOutput::DirectAnswer(answer) => {
                tracing::info!(task_id, "direct answer, no execution needed");
                send_event(events, TaskEvent::PlanReady { task_id: task_id.to_string(), steps: 0 });
                let reasoning = vec![ReasoningEntry::new(
                    None,
                    ReasoningPhase::Final,
                    "the task needs no execution",
                    "answer directly",
                )];
                checkpoint.save(&reasoning, true).await;
                send_event(
                    events,
                    TaskEvent::Finished {
                        answer: answer.clone(),
                        steps_run: 0,
                    },
                );
                return Ok(TaskReport {
                    task_id: task_id.to_string(),
                    answer,
                    trace: ExecutionTrace::new(),
                    reasoning,
                    artifacts: Vec::new(),
                    sandbox_id: None,
                    replans: 0,
                    direct: true,
                });
            }
            PlannerOutput::Plan(p) => p,
        };

        let dropped = plan.truncate(self.settings.max_steps);
        if dropped > 0 {
            tracing::warn!(task_id, dropped, max = self.settings.max_steps, "plan over the step limit, extra steps dropped");
        }
        tracing::info!(task_id, steps = plan.len(), "plan ready");
        send_event(
            events,
            TaskEvent::PlanReady {
                task_id: task_id.to_string(),
                steps: plan.len(),
            },
        );

        let outcome = PlanLoop::new(
            &self.planner,
            &self.critic,
            &self.dispatcher,
            &self.recovery,
            &self.settings.loop_settings,
        )
        .with_event_tx(events)
        .with_checkpoint(&checkpoint)
        .run(&req.task, plan, ctx)
        .await;

        let mut reasoning = outcome.reasoning;
        let synthesized = with_timeout(
            "synthesis",
            self.settings.finalize_timeout,
            self.planner.synthesize(&req.task, &outcome.trace, &req.history),
        )
        .await;
        let answer = match synthesized {
            Ok(answer) => {
                reasoning.push(ReasoningEntry::new(
                    None,
                    ReasoningPhase::Final,
                    format!("{} step(s) ran, {} failed", outcome.trace.len(), outcome.trace.error_count()),
                    "synthesize answer",
                ));
                answer
            }
            Err(e) => {
                let action = self.recovery.handle(Phase::Synthesis, &e);
                tracing::warn!(task_id, error = %e, ?action, "synthesis failed, using fallback answer");
                reasoning.push(
                    ReasoningEntry::new(
                        None,
                        ReasoningPhase::Final,
                        format!("synthesis failed: {}", e),
                        "fallback answer",
                    )
                    .failed(),
                );
                self.recovery.fallback_answer(&req.task, &outcome.trace, &e)
            }
        };
        checkpoint.save(&reasoning, true).await;

        send_event(
            events,
            TaskEvent::Finished {
                answer: answer.clone(),
                steps_run: outcome.trace.len(),
            },
        );
        Ok(TaskReport {
            task_id: task_id.to_string(),
            answer,
            artifacts: outcome.trace.artifacts(),
            trace: outcome.trace,
            reasoning,
            sandbox_id: ctx.sandbox_id().await,
            replans: outcome.replans,
            direct: false,
        })
    }

    /// 进程退出：停止全部工具服务器并销毁残留沙箱
    pub async fn shutdown(&self) {
        self.protocol.stop_all().await;
        self.sandboxes.shutdown().await;
    }
}

/// 按配置组装编排器，并启动配置中的外部工具服务器
pub async fn create_orchestrator(cfg: &AppConfig) -> anyhow::Result<Orchestrator> {
    anyhow::ensure!(
        cfg.sandbox.workdir.starts_with('/'),
        "sandbox.workdir must be absolute, got {}",
        cfg.sandbox.workdir
    );

    let llm = create_llm_from_config(cfg);
    let sandboxes = Arc::new(SandboxManager::from_config(&cfg.sandbox));
    let protocol = Arc::new(ToolProtocolClient::from_config(&cfg.protocol));
    let started = protocol.start_all(&cfg.protocol.servers).await;
    tracing::info!(
        configured = cfg.protocol.servers.len(),
        started,
        runtime = sandboxes.runtime_name(),
        "orchestrator components ready"
    );

    let store: Arc<dyn ReasoningStore> = match &cfg.app.reasoning_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create reasoning dir {}", dir.display()))?;
            Arc::new(JsonFileReasoningStore::new(dir))
        }
        None => Arc::new(NoopReasoningStore),
    };

    let settings = OrchestratorSettings::from_section(&cfg.orchestrator, cfg.tools.tool_timeout_secs);
    Ok(Orchestrator::new(
        llm,
        sandboxes,
        protocol,
        default_registry(&cfg.tools),
        settings,
    )
    .with_store(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::memory::InMemoryReasoningStore;
    use crate::react::prompts::{GENERATION_MARKER, PLANNER_MARKER, REFLECTION_MARKER, SYNTHESIS_MARKER};
    use crate::sandbox::{InMemoryRuntime, RetryPolicy};
    use crate::tools::GenerationExecutor;

    fn orchestrator(llm: MockLlmClient) -> (Orchestrator, Arc<InMemoryRuntime>) {
        let runtime = Arc::new(InMemoryRuntime::default());
        let sandboxes = Arc::new(SandboxManager::new(
            runtime.clone(),
            RetryPolicy::default(),
            "orch",
            "/workspace",
        ));
        let mut registry = ExecutorRegistry::new();
        registry.register(GenerationExecutor::new());
        let o = Orchestrator::new(
            Arc::new(llm),
            sandboxes,
            Arc::new(ToolProtocolClient::default()),
            registry,
            OrchestratorSettings::default(),
        );
        (o, runtime)
    }

    #[test]
    fn test_request_history_is_bounded() {
        let mut history = vec![Message::system("caller persona")];
        for i in 0..20 {
            history.push(Message::user(format!("q{i}")));
            history.push(Message::assistant(format!("a{i}")));
        }
        let req = TaskRequest::new("t").with_history(history);
        assert_eq!(req.history.len(), HISTORY_TURNS * 2);
        assert_eq!(req.history.last().unwrap().content, "a19");
    }

    #[test]
    fn test_settings_from_section() {
        let s = OrchestratorSettings::default();
        assert_eq!(s.max_steps, 20);
        assert_eq!(s.plan_timeout, Duration::from_secs(60));
        assert_eq!(s.loop_settings.replan, ReplanPolicy::default());
        assert_eq!(s.loop_settings.progress_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_plan_truncated_to_max_steps() {
        let steps: serde_json::Map<String, serde_json::Value> = (1..=5)
            .map(|i| {
                (
                    format!("step{}", i),
                    serde_json::json!({"step": format!("s{}", i), "action": "generation", "usingData": "none"}),
                )
            })
            .collect();
        let llm = MockLlmClient::new()
            .on(PLANNER_MARKER, serde_json::Value::Object(steps).to_string())
            .on(GENERATION_MARKER, "x")
            .on(REFLECTION_MARKER, "OK")
            .on(SYNTHESIS_MARKER, r#"{"answer": "done"}"#);
        let (mut o, _) = orchestrator(llm);
        o.settings.max_steps = 3;
        let report = o.run_detailed(TaskRequest::new("t"), None).await.unwrap();
        assert_eq!(report.trace.len(), 3);
        assert_eq!(report.answer, "done");
        assert!(!report.direct);
    }

    #[tokio::test]
    async fn test_final_reasoning_is_persisted() {
        let llm = MockLlmClient::new()
            .on(
                PLANNER_MARKER,
                r#"{"step1": {"step": "a", "action": "generation", "usingData": "none"}}"#,
            )
            .on(GENERATION_MARKER, "x")
            .on(REFLECTION_MARKER, "OK")
            .on(SYNTHESIS_MARKER, "final text");
        let (o, _) = orchestrator(llm);
        let store = Arc::new(InMemoryReasoningStore::new());
        let o = o.with_store(store.clone());
        let report = o
            .run_detailed(TaskRequest::new("t").user("u1", "s1"), None)
            .await
            .unwrap();
        let saved = store.latest(&report.task_id).unwrap();
        assert!(saved.complete);
        assert_eq!(saved.user_id, "u1");
        assert_eq!(saved.entries.len(), report.reasoning.len());
        assert_eq!(saved.entries.last().unwrap().phase, ReasoningPhase::Final);
    }

    #[tokio::test]
    async fn test_sandbox_released_after_run() {
        let llm = MockLlmClient::new()
            .on(
                PLANNER_MARKER,
                r#"{"step1": {"step": "a", "action": "generation", "usingData": "none", "params": {"path": "out.md"}}}"#,
            )
            .on(GENERATION_MARKER, "content")
            .on(REFLECTION_MARKER, "OK")
            .on(SYNTHESIS_MARKER, "ok");
        let (o, runtime) = orchestrator(llm);
        let report = o.run_detailed(TaskRequest::new("t"), None).await.unwrap();
        let id = report.sandbox_id.unwrap();
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(runtime.removed(), vec![id]);
        assert_eq!(runtime.live_count(), 0);
    }
}
