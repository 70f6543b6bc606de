//! 执行器注册表
//!
//! 执行器集合是封闭的：ExecutorKind 枚举列出全部种类，计划中的 action 字段按名解析，
//! 无法识别的名字解析为 Unknown，由分发器产出占位结果。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::AgentError;
use crate::react::{Artifact, Step};
use crate::tools::TaskContext;

/// 执行器种类（线上名为 camelCase）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorKind {
    CodeExecution,
    FileSystem,
    Research,
    Generation,
    ToolCall,
    Unknown,
}

impl ExecutorKind {
    pub const ALL: [ExecutorKind; 5] = [
        ExecutorKind::CodeExecution,
        ExecutorKind::FileSystem,
        ExecutorKind::Research,
        ExecutorKind::Generation,
        ExecutorKind::ToolCall,
    ];

    /// 按名解析；大小写、连字符与下划线不敏感
    pub fn parse(name: &str) -> Self {
        let norm: String = name
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_lowercase();
        match norm.as_str() {
            "codeexecution" | "code" => ExecutorKind::CodeExecution,
            "filesystem" | "file" | "fileoperations" => ExecutorKind::FileSystem,
            "research" | "search" => ExecutorKind::Research,
            "generation" | "generate" => ExecutorKind::Generation,
            "toolcall" | "tool" => ExecutorKind::ToolCall,
            _ => ExecutorKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::CodeExecution => "codeExecution",
            ExecutorKind::FileSystem => "fileSystem",
            ExecutorKind::Research => "research",
            ExecutorKind::Generation => "generation",
            ExecutorKind::ToolCall => "toolCall",
            ExecutorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 交给执行器的一步：计划中的步骤 + 细化后的指令 + 选中的前序结果
#[derive(Debug, Clone)]
pub struct StepInput<'a> {
    pub index: usize,
    pub task: &'a str,
    pub step: &'a Step,
    /// 执行前细化得到的指令；没有细化时为 None
    pub instruction: Option<String>,
    /// 按 usingData 选出并渲染好的前序结果
    pub prior: String,
}

impl StepInput<'_> {
    /// 给模型看的步骤描述
    pub fn describe(&self) -> String {
        let mut out = format!("Overall task: {}\n\nThis step: {}", self.task, self.step.intent);
        if !self.step.expected_output.is_empty() {
            out.push_str(&format!("\nExpected output: {}", self.step.expected_output));
        }
        if let Some(instruction) = &self.instruction {
            out.push_str(&format!("\n\nInstructions:\n{}", instruction));
        }
        if !self.prior.is_empty() {
            out.push_str(&format!("\n\nResults of earlier steps:\n{}", self.prior));
        }
        out
    }
}

/// 执行器产出：结构化输出 + 产物
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub output: Value,
    pub artifacts: Vec<Artifact>,
}

impl StepOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

/// 执行器 trait
#[async_trait]
pub trait StepExecutor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    async fn execute(&self, input: &StepInput<'_>, ctx: &TaskContext) -> Result<StepOutput, AgentError>;
}

/// 执行器注册表：按种类存储 Arc<dyn StepExecutor>
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<ExecutorKind, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: impl StepExecutor + 'static) {
        self.executors.insert(executor.kind(), Arc::new(executor));
    }

    pub fn get(&self, kind: ExecutorKind) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(&kind).cloned()
    }
}
