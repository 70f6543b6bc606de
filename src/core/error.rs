//! 编排层错误类型与恢复动作
//!
//! 底层（沙箱、协议、LLM）各自返回带类型的错误，这里统一汇总为 AgentError；
//! RecoveryEngine 根据所处阶段与错误决定：终止任务 / 记录后继续 / 视为无变化 / 回退文案。

use thiserror::Error;

use crate::llm::LlmError;
use crate::protocol::ProtocolError;
use crate::sandbox::SandboxError;

/// 任务运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 获取或解析初始计划失败（对任务致命）
    #[error("Planning failed: {0}")]
    Planning(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("{what} timed out after {secs}s")]
    Timeout { what: String, secs: u64 },

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Step failed: {0}")]
    StepFailed(String),

    #[error("Step timeout: {0}")]
    StepTimeout(String),
}

impl AgentError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AgentError::Timeout { .. } | AgentError::StepTimeout(_))
    }
}

/// 出错时所处的编排阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    InitialPlan,
    Refine,
    Reflection,
    Replan,
    Synthesis,
}

/// 恢复引擎根据阶段与错误给出的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 终止任务，把错误交还调用方
    Abort,
    /// 在轨迹中记录错误标记，继续下一步
    RecordAndContinue,
    /// 当作「计划无需变化」处理
    AssumeNoChange,
    /// 使用模板化的兜底回答
    FallbackAnswer,
}
