//! 沙箱错误与错误分类
//!
//! 运行时（docker CLI 等）只给出错误文本，这里按文本把错误分为 Transient（重试）与 Permanent（立即失败）；
//! 两类都匹配不到时按 Transient 处理。

use std::sync::OnceLock;

use regex::RegexSet;
use thiserror::Error;

/// 重试判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("path must be absolute inside the sandbox: {0}")]
    RelativePath(String),

    #[error("no such sandbox: {0}")]
    UnknownSandbox(String),

    #[error("{path} not found in sandbox {sandbox}{diagnostics}")]
    NotFound {
        sandbox: String,
        path: String,
        diagnostics: String,
    },

    #[error("{op} failed: {message}")]
    Runtime { op: &'static str, message: String },

    #[error("{op} gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        op: &'static str,
        attempts: u32,
        last: Box<SandboxError>,
    },

    #[error("host staging failed: {0}")]
    Staging(#[from] std::io::Error),
}

impl SandboxError {
    pub fn runtime(op: &'static str, message: impl Into<String>) -> Self {
        SandboxError::Runtime {
            op,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SandboxError::RelativePath(_)
            | SandboxError::UnknownSandbox(_)
            | SandboxError::NotFound { .. }
            | SandboxError::RetriesExhausted { .. } => ErrorClass::Permanent,
            SandboxError::Runtime { message, .. } => classify_message(message),
            SandboxError::Staging(e) => classify_message(&e.to_string()),
        }
    }

    /// 容器名冲突：provision 时换一个新名字重试
    pub fn is_name_conflict(&self) -> bool {
        match self {
            SandboxError::Runtime { message, .. } => {
                let m = message.to_lowercase();
                m.contains("conflict") || m.contains("already in use")
            }
            _ => false,
        }
    }
}

fn permanent_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"(?i)no such file",
            r"(?i)no such directory",
            r"(?i)not a directory",
            r"(?i)could not find the file",
            r"(?i)no such (container|sandbox|object)",
            r"(?i)invalid reference format",
            r"(?i)malformed",
            r"(?i)path .*must be absolute",
        ])
        .unwrap_or_else(|_| RegexSet::empty())
    })
}

fn transient_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"(?i)conflict",
            r"(?i)already in use",
            r"(?i)timed? ?out",
            r"(?i)connection refused",
            r"(?i)resource busy",
            r"(?i)temporarily unavailable",
        ])
        .unwrap_or_else(|_| RegexSet::empty())
    })
}

/// 按错误文本分类；永久性条件优先，未识别的错误保守地视为可重试
pub fn classify_message(message: &str) -> ErrorClass {
    if permanent_patterns().is_match(message) {
        return ErrorClass::Permanent;
    }
    if !transient_patterns().is_match(message) {
        tracing::debug!(message = %message, "unclassified sandbox error, treating as retryable");
    }
    ErrorClass::Transient
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_messages() {
        for msg in [
            "cat: /x: No such file or directory",
            "Error: No such container: conductor-abc",
            "Error: Could not find the file /workspace/out.txt in container c1",
            "invalid reference format: repository name must be lowercase",
            "mkdir: /a/b: Not a directory",
        ] {
            assert_eq!(classify_message(msg), ErrorClass::Permanent, "{msg}");
        }
    }

    #[test]
    fn test_transient_messages() {
        for msg in [
            "Conflict. The container name \"/c1\" is already in use",
            "dial unix /var/run/docker.sock: connect: connection refused",
            "context deadline exceeded: timed out",
            "device or resource busy",
        ] {
            assert_eq!(classify_message(msg), ErrorClass::Transient, "{msg}");
        }
    }

    #[test]
    fn test_unclassified_defaults_to_transient() {
        assert_eq!(classify_message("something odd happened"), ErrorClass::Transient);
    }

    #[test]
    fn test_error_variants_classify() {
        assert_eq!(
            SandboxError::RelativePath("a.txt".into()).class(),
            ErrorClass::Permanent
        );
        let conflict = SandboxError::runtime("provision", "Conflict. name already in use");
        assert_eq!(conflict.class(), ErrorClass::Transient);
        assert!(conflict.is_name_conflict());
        assert!(!SandboxError::runtime("exec", "timeout").is_name_conflict());
    }
}
