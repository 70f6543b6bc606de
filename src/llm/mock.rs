//! Mock LLM 客户端（用于测试与无 API Key 时的本地运行）
//!
//! 按规则匹配 system 消息中的片段返回预设回复，可模拟失败与超时；
//! 未命中任何规则时回显最后一条 User 消息，并以 directAnswer 形式返回，便于本地跑通流程。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role};

enum Behavior {
    /// 依次返回；只剩最后一条时重复返回
    Replies(VecDeque<String>),
    Fail(String),
    Hang(Duration),
}

struct Rule {
    needle: String,
    behavior: Behavior,
}

/// Mock 客户端：needle 命中 system 消息即使用对应行为
#[derive(Default)]
pub struct MockLlmClient {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 命中 needle 时返回固定回复
    pub fn on(self, needle: &str, reply: impl Into<String>) -> Self {
        self.push_rule(needle, Behavior::Replies(VecDeque::from([reply.into()])))
    }

    /// 命中 needle 时依次返回多条回复（最后一条重复）
    pub fn on_sequence(self, needle: &str, replies: Vec<String>) -> Self {
        self.push_rule(needle, Behavior::Replies(replies.into()))
    }

    pub fn fail_on(self, needle: &str, message: impl Into<String>) -> Self {
        self.push_rule(needle, Behavior::Fail(message.into()))
    }

    /// 命中 needle 时挂起指定时长（用于超时测试）
    pub fn hang_on(self, needle: &str, duration: Duration) -> Self {
        self.push_rule(needle, Behavior::Hang(duration))
    }

    fn push_rule(self, needle: &str, behavior: Behavior) -> Self {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                needle: needle.to_string(),
                behavior,
            });
        }
        self
    }

    /// 总调用次数
    pub fn calls(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// system 消息包含 needle 的调用次数
    pub fn calls_matching(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|s| s.contains(needle)).count())
            .unwrap_or(0)
    }
}

enum Outcome {
    Reply(String),
    Fail(String),
    Hang(Duration),
    Echo,
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let system: String = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_else(|| "(no input)".to_string());

        if let Ok(mut calls) = self.calls.lock() {
            calls.push(system.clone());
        }

        let outcome = {
            let mut rules = self
                .rules
                .lock()
                .map_err(|_| LlmError::Request("mock rules poisoned".to_string()))?;
            match rules.iter_mut().find(|r| system.contains(&r.needle)) {
                Some(rule) => match &mut rule.behavior {
                    Behavior::Replies(queue) => {
                        let reply = if queue.len() > 1 {
                            queue.pop_front().unwrap_or_default()
                        } else {
                            queue.front().cloned().unwrap_or_default()
                        };
                        Outcome::Reply(reply)
                    }
                    Behavior::Fail(msg) => Outcome::Fail(msg.clone()),
                    Behavior::Hang(d) => Outcome::Hang(*d),
                },
                None => Outcome::Echo,
            }
        };

        match outcome {
            Outcome::Reply(r) => Ok(r),
            Outcome::Fail(msg) => Err(LlmError::Request(msg)),
            Outcome::Hang(d) => {
                tokio::time::sleep(d).await;
                Err(LlmError::Request("mock hang elapsed".to_string()))
            }
            Outcome::Echo => Ok(serde_json::json!({
                "directAnswer": true,
                "answer": format!("Echo from Mock: {}", last_user),
            })
            .to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rules_and_sequence() {
        let mock = MockLlmClient::new()
            .on_sequence("alpha", vec!["one".into(), "two".into()])
            .fail_on("beta", "down");

        let alpha = vec![Message::system("alpha prompt"), Message::user("x")];
        assert_eq!(mock.complete(&alpha).await.unwrap(), "one");
        assert_eq!(mock.complete(&alpha).await.unwrap(), "two");
        assert_eq!(mock.complete(&alpha).await.unwrap(), "two");

        let beta = vec![Message::system("beta prompt")];
        assert!(mock.complete(&beta).await.is_err());
        assert_eq!(mock.calls(), 4);
        assert_eq!(mock.calls_matching("alpha"), 3);
    }

    #[tokio::test]
    async fn test_echo_default_is_direct_answer() {
        let mock = MockLlmClient::new();
        let out = mock
            .complete(&[Message::system("anything"), Message::user("hi")])
            .await
            .unwrap();
        assert!(out.contains("\"directAnswer\":true"));
        assert!(out.contains("Echo from Mock: hi"));
    }
}
