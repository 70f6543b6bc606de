//! 编排器端到端测试：Mock LLM + 内存沙箱运行时

use std::sync::Arc;
use std::time::Duration;

use conductor::config::ToolsSection;
use conductor::core::{AgentError, Orchestrator, OrchestratorSettings, TaskRequest};
use conductor::llm::MockLlmClient;
use conductor::protocol::ToolProtocolClient;
use conductor::react::prompts::{
    FILE_OPS_MARKER, GENERATION_MARKER, PLANNER_MARKER, REFLECTION_MARKER, REPLAN_MARKER,
    SYNTHESIS_MARKER,
};
use conductor::react::TaskEvent;
use conductor::sandbox::{InMemoryRuntime, RetryPolicy, SandboxManager, SandboxStatus};
use conductor::tools::default_registry;
use serde_json::json;

struct Harness {
    llm: Arc<MockLlmClient>,
    runtime: Arc<InMemoryRuntime>,
    orchestrator: Orchestrator,
}

fn harness_with(llm: MockLlmClient, settings: OrchestratorSettings) -> Harness {
    let llm = Arc::new(llm);
    let runtime = Arc::new(InMemoryRuntime::default());
    let sandboxes = Arc::new(SandboxManager::new(
        runtime.clone(),
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(10)),
        "e2e",
        "/workspace",
    ));
    let orchestrator = Orchestrator::new(
        llm.clone(),
        sandboxes,
        Arc::new(ToolProtocolClient::default()),
        default_registry(&ToolsSection::default()),
        settings,
    );
    Harness {
        llm,
        runtime,
        orchestrator,
    }
}

fn harness(llm: MockLlmClient) -> Harness {
    harness_with(llm, OrchestratorSettings::default())
}

#[tokio::test]
async fn test_trace_has_one_result_per_step_including_placeholders() {
    let plan = json!({
        "step1": {"step": "draft intro", "action": "generation", "expectedOutput": "text", "usingData": "none"},
        "step2": {"step": "beam it up", "action": "teleport", "expectedOutput": "?", "usingData": "none"},
        "step3": {"step": "draft outro", "action": "generation", "expectedOutput": "text", "usingData": "none"}
    });
    let h = harness(
        MockLlmClient::new()
            .on(PLANNER_MARKER, plan.to_string())
            .on(GENERATION_MARKER, "some text")
            .on(REFLECTION_MARKER, r#"{"changePlan": false}"#)
            .on(SYNTHESIS_MARKER, "summary"),
    );

    let report = h
        .orchestrator
        .run_detailed(TaskRequest::new("write two paragraphs"), None)
        .await
        .unwrap();

    assert_eq!(report.trace.len(), 3);
    let placeholder = report.trace.get(1).unwrap();
    assert!(!placeholder.is_error);
    assert_eq!(placeholder.output["skipped"], json!(true));
    assert_eq!(report.answer, "summary");
    // generation 不需要沙箱
    assert!(report.sandbox_id.is_none());
    assert!(h.runtime.created().is_empty());
}

#[tokio::test]
async fn test_file_written_in_sandbox_and_sandbox_destroyed() {
    let plan = json!({
        "step1": {"step": "create hello.txt containing Hello, world", "action": "fileSystem", "expectedOutput": "file", "usingData": "none"},
        "step2": {"step": "read it back", "action": "fileSystem", "expectedOutput": "content", "usingData": "none",
                  "params": {"actions": [{"op": "read", "path": "hello.txt"}]}}
    });
    let h = harness(
        MockLlmClient::new()
            .on(PLANNER_MARKER, plan.to_string())
            .on(
                FILE_OPS_MARKER,
                r#"{"actions": [{"op": "write", "path": "hello.txt", "content": "Hello, world"}], "done": true}"#,
            )
            .on(REFLECTION_MARKER, "OK")
            .on(SYNTHESIS_MARKER, r#"{"answer": "Created /workspace/hello.txt"}"#),
    );

    let report = h
        .orchestrator
        .run_detailed(TaskRequest::new("create hello.txt").user("u1", "s1"), None)
        .await
        .unwrap();

    assert_eq!(report.answer, "Created /workspace/hello.txt");
    assert_eq!(report.trace.error_count(), 0);
    let read = &report.trace.get(1).unwrap().output;
    assert_eq!(read["actions"][0]["result"]["content"], json!("Hello, world"));

    assert_eq!(report.artifacts.len(), 1);
    assert_eq!(report.artifacts[0].path, "/workspace/hello.txt");
    assert_eq!(report.artifacts[0].content.as_deref(), Some("Hello, world"));

    let sandbox = report.sandbox_id.unwrap();
    assert_eq!(h.runtime.created(), vec![sandbox.clone()]);
    assert_eq!(h.runtime.removed(), vec![sandbox.clone()]);
    assert_eq!(h.runtime.live_count(), 0);
    assert_eq!(
        h.orchestrator.sandboxes().status(&sandbox),
        Some(SandboxStatus::Destroyed)
    );
}

#[tokio::test]
async fn test_two_step_plan_never_replans() {
    let plan = json!({
        "step1": {"step": "a", "action": "generation", "usingData": "none"},
        "step2": {"step": "b", "action": "generation", "usingData": "all"}
    });
    let h = harness(
        MockLlmClient::new()
            .on(PLANNER_MARKER, plan.to_string())
            .on(GENERATION_MARKER, "text")
            .on(REFLECTION_MARKER, r#"{"changePlan": true, "reason": "try another way"}"#)
            .on(REPLAN_MARKER, plan.to_string())
            .on(SYNTHESIS_MARKER, "done"),
    );

    let report = h
        .orchestrator
        .run_detailed(TaskRequest::new("t"), None)
        .await
        .unwrap();

    assert_eq!(report.trace.len(), 2);
    assert_eq!(report.replans, 0);
    assert_eq!(h.llm.calls_matching(REFLECTION_MARKER), 2);
    assert_eq!(h.llm.calls_matching(REPLAN_MARKER), 0);
}

#[tokio::test]
async fn test_direct_answer_skips_execution() {
    let h = harness(MockLlmClient::new().on(
        PLANNER_MARKER,
        r#"{"directAnswer": true, "answer": "Hello there"}"#,
    ));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let report = h
        .orchestrator
        .run_detailed(TaskRequest::new("hi"), Some(&tx))
        .await
        .unwrap();

    assert!(report.direct);
    assert_eq!(report.answer, "Hello there");
    assert!(report.trace.is_empty());
    assert!(report.sandbox_id.is_none());
    assert!(h.runtime.created().is_empty());
    assert_eq!(h.llm.calls(), 1);

    drop(tx);
    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }
    assert!(matches!(events.first(), Some(TaskEvent::PlanReady { steps: 0, .. })));
    assert!(matches!(events.last(), Some(TaskEvent::Finished { steps_run: 0, .. })));
}

#[tokio::test]
async fn test_planning_failure_is_fatal() {
    let h = harness(MockLlmClient::new().on(PLANNER_MARKER, "I am not sure how to help."));
    let err = h.orchestrator.run("t", "u", "s").await.unwrap_err();
    assert!(matches!(err, AgentError::Planning(_)), "{err:?}");

    let h = harness(MockLlmClient::new().fail_on(PLANNER_MARKER, "503 upstream"));
    let err = h.orchestrator.run("t", "u", "s").await.unwrap_err();
    assert!(matches!(err, AgentError::Planning(_)), "{err:?}");
    assert!(err.to_string().contains("503 upstream"));
    assert!(h.runtime.created().is_empty());
}

#[tokio::test]
async fn test_synthesis_timeout_uses_fallback_answer() {
    let plan = json!({
        "step1": {"step": "a", "action": "generation", "usingData": "none"},
        "step2": {"step": "b", "action": "codeExecution", "usingData": "none",
                  "params": {"language": "cobol", "code": "DISPLAY 'HI'."}}
    });
    let mut settings = OrchestratorSettings::default();
    settings.finalize_timeout = Duration::from_millis(100);
    let h = harness_with(
        MockLlmClient::new()
            .on(PLANNER_MARKER, plan.to_string())
            .on(GENERATION_MARKER, "first part")
            .on(REFLECTION_MARKER, "OK")
            .hang_on(SYNTHESIS_MARKER, Duration::from_secs(5)),
        settings,
    );

    let report = h
        .orchestrator
        .run_detailed(TaskRequest::new("t"), None)
        .await
        .unwrap();

    assert_eq!(report.trace.len(), 2);
    assert_eq!(report.trace.error_count(), 1);
    assert!(report.answer.starts_with("Task completed with errors"), "{}", report.answer);
    assert!(report.answer.contains("unsupported language"));
    assert!(report.answer.contains("first part"));
    assert!(report.reasoning.last().unwrap().is_error);
}
