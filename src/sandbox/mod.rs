//! 沙箱层：每个任务一个隔离容器，错误分类重试，保证销毁
//!
//! - **runtime**: ContainerRuntime 抽象（create / exec / copy_in / copy_out / remove）
//! - **docker**: docker CLI 实现
//! - **memory**: 进程内模拟实现（测试 / 离线）
//! - **retry**: 指数退避重试
//! - **manager**: SandboxManager，任务 → 沙箱生命周期

pub mod docker;
pub mod error;
pub mod manager;
pub mod memory;
pub mod retry;
pub mod runtime;

pub use docker::DockerRuntime;
pub use error::{classify_message, ErrorClass, SandboxError};
pub use manager::{SandboxManager, SandboxRecord, SandboxStatus};
pub use memory::InMemoryRuntime;
pub use retry::{with_retry, RetryPolicy};
pub use runtime::{shell_quote, ContainerRuntime, ExecOutput};
