//! Conductor - Rust 自主任务编排器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务编排器、错误类型、阶段化恢复
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 对话消息与推理记录持久化
//! - **observability**: tracing 初始化
//! - **protocol**: 外部工具服务器（子进程，行分隔 JSON-RPC）客户端
//! - **react**: 计划、Planner、Critic、执行轨迹与计划执行主循环
//! - **sandbox**: 每任务一个的隔离容器，错误分类重试与保证销毁
//! - **tools**: 五种步骤执行器与分发器

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod protocol;
pub mod react;
pub mod sandbox;
pub mod tools;
