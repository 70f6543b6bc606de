//! 记忆层：对话消息与推理轨迹持久化

pub mod conversation;
pub mod persistence;

pub use conversation::{recent_turns, Message, Role, HISTORY_TURNS};
pub use persistence::{
    InMemoryReasoningStore, JsonFileReasoningStore, NoopReasoningStore, PersistError, ReasoningRecord,
    ReasoningStore,
};
