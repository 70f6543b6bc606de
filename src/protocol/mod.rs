//! 外部工具协议：子进程工具服务器，按行 JSON-RPC，请求按 id 关联
//!
//! - **message**: 线格式与能力描述
//! - **session**: 单个服务器会话（pending 表、读取任务、生命周期）
//! - **client**: 多服务器管理（start / list / invoke / stop）

pub mod client;
pub mod error;
pub mod message;
pub mod session;

pub use client::{ServerSpec, ToolProtocolClient};
pub use error::ProtocolError;
pub use message::{parse_capabilities, Capability, RemoteError, Request, Response};
pub use session::{ProtocolSession, SessionState};
