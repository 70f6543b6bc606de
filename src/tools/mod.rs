//! 执行层：执行器注册表、任务上下文、步骤分发器与五种执行器

pub mod code;
pub mod context;
pub mod executor;
pub mod external;
pub mod filesystem;
pub mod generation;
pub mod registry;
pub mod research;

pub use code::CodeExecutor;
pub use context::TaskContext;
pub use executor::StepDispatcher;
pub use external::{render_catalog, ToolCallExecutor};
pub use filesystem::{FileAction, FileSystemExecutor};
pub use generation::GenerationExecutor;
pub use registry::{ExecutorKind, ExecutorRegistry, StepExecutor, StepInput, StepOutput};
pub use research::{ResearchExecutor, WebFetcher};

use crate::config::ToolsSection;

/// 注册全部内置执行器
pub fn default_registry(cfg: &ToolsSection) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register(CodeExecutor::new());
    registry.register(FileSystemExecutor::new());
    registry.register(ResearchExecutor::from_config(cfg));
    registry.register(GenerationExecutor::new());
    registry.register(ToolCallExecutor::new());
    registry
}
