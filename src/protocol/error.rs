//! 协议层错误
//!
//! ServerClosed / Io / Spawn 属于会话级失败（整个服务器不可用），
//! Remote / Malformed / Timeout 只影响单次调用。

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("server {0} closed")]
    ServerClosed(String),

    #[error("unknown tool server: {0}")]
    UnknownServer(String),

    #[error("tool server {0} already started")]
    AlreadyStarted(String),

    #[error("failed to spawn {server}: {message}")]
    Spawn { server: String, message: String },

    #[error("i/o error talking to {server}: {message}")]
    Io { server: String, message: String },

    #[error("remote error: {message}")]
    Remote { message: String, code: Option<i64> },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("{server} did not answer {method} within {secs}s")]
    Timeout {
        server: String,
        method: String,
        secs: u64,
    },
}

impl ProtocolError {
    /// 会话级失败：服务器已不可用
    pub fn is_session_level(&self) -> bool {
        matches!(
            self,
            ProtocolError::ServerClosed(_)
                | ProtocolError::UnknownServer(_)
                | ProtocolError::Spawn { .. }
                | ProtocolError::Io { .. }
        )
    }
}
