//! 核心编排层：错误类型、阶段化恢复、任务编排器

pub mod error;
pub mod orchestrator;
pub mod recovery;

pub use error::{AgentError, Phase, RecoveryAction};
pub use orchestrator::{create_orchestrator, Orchestrator, OrchestratorSettings, TaskReport, TaskRequest};
pub use recovery::RecoveryEngine;
