//! 调用方对话历史
//!
//! 历史由外部协作方保存，编排器只在规划与汇总时携带最近几轮；
//! 历史中的 system 消息会被丢弃，system prompt 始终由各阶段自己提供。

use serde::{Deserialize, Serialize};

/// 每个任务最多携带的对话轮数（一轮 = user + assistant）
pub const HISTORY_TURNS: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// 只保留最近 max_turns 轮的 user/assistant 消息，顺序不变
pub fn recent_turns(history: Vec<Message>, max_turns: usize) -> Vec<Message> {
    let mut kept: Vec<Message> = history
        .into_iter()
        .filter(|m| m.role != Role::System && !m.content.trim().is_empty())
        .collect();
    let keep = max_turns * 2;
    if kept.len() > keep {
        kept.drain(..kept.len() - keep);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_turns_drops_system_and_old_messages() {
        let mut history = vec![Message::system("old persona")];
        for i in 0..5 {
            history.push(Message::user(format!("q{i}")));
            history.push(Message::assistant(format!("a{i}")));
        }
        let kept = recent_turns(history, 2);
        let texts: Vec<&str> = kept.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["q3", "a3", "q4", "a4"]);
        assert!(kept.iter().all(|m| m.role != Role::System));
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let v = serde_json::to_value(Message::assistant("hi")).unwrap();
        assert_eq!(v["role"], "assistant");
    }
}
