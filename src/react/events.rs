//! 任务进度事件：供调用方流式展示计划、步骤执行、反思与最终结果

use serde::Serialize;

/// 单个进度事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// 初始计划就绪（directAnswer 时 steps 为 0）
    PlanReady { task_id: String, steps: usize },
    StepStarted {
        index: usize,
        executor: String,
        intent: String,
    },
    /// 步骤结束（预览，避免过长）
    StepFinished {
        index: usize,
        executor: String,
        is_error: bool,
        preview: String,
    },
    Reflection {
        index: usize,
        change_plan: bool,
        reason: String,
    },
    /// 计划被替换
    Replanned { at_index: usize, steps: usize },
    Finished { answer: String, steps_run: usize },
    Error { text: String },
}
