//! 认知层：计划数据结构、Planner、Critic、执行轨迹与计划执行主循环

pub mod critic;
pub mod events;
pub mod loop_;
pub mod plan;
pub mod planner;
pub mod prompts;
pub mod trace;

pub use critic::{parse_reflection, Critic, Reflection};
pub use events::TaskEvent;
pub use loop_::{
    send_event, with_timeout, EventSender, LoopOutcome, LoopSettings, PlanLoop,
    ReasoningCheckpoint, ReplanPolicy,
};
pub use plan::{parse_plan, parse_plan_value, plan_step_schema_json, DataSelector, Plan, PlannerOutput, Step};
pub use planner::Planner;
pub use trace::{Artifact, ExecutionTrace, ReasoningEntry, ReasoningPhase, StepResult};
