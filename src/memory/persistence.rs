//! 推理轨迹持久化
//!
//! ReasoningEntry 由编排器每 N 步及任务结束时整体写出；持久化属于外部协作方，
//! 这里只提供 trait 与两个实现：JSON 文件（每个任务一个文件）与内存（测试用）。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::react::ReasoningEntry;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("reasoning store i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("reasoning record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("reasoning store unavailable: {0}")]
    Unavailable(String),
}

/// 推理轨迹存储：save 为整体覆盖写，调用方每次传入完整轨迹
#[async_trait]
pub trait ReasoningStore: Send + Sync {
    async fn save(&self, record: &ReasoningRecord) -> Result<(), PersistError>;
}

/// 一次落盘的内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningRecord {
    pub task_id: String,
    pub user_id: String,
    pub session_id: String,
    pub complete: bool,
    pub entries: Vec<ReasoningEntry>,
}

/// 不落盘
#[derive(Debug, Default)]
pub struct NoopReasoningStore;

#[async_trait]
impl ReasoningStore for NoopReasoningStore {
    async fn save(&self, _record: &ReasoningRecord) -> Result<(), PersistError> {
        Ok(())
    }
}

/// 文件持久化：{dir}/{task_id}.json；父目录不存在时自动创建
#[derive(Debug)]
pub struct JsonFileReasoningStore {
    dir: PathBuf,
}

impl JsonFileReasoningStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", task_id))
    }

    /// 读取某任务最近一次写出的轨迹；文件不存在时返回 None
    pub async fn load(&self, task_id: &str) -> Result<Option<ReasoningRecord>, PersistError> {
        let path = self.path_for(task_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&data)?))
    }
}

#[async_trait]
impl ReasoningStore for JsonFileReasoningStore {
    async fn save(&self, record: &ReasoningRecord) -> Result<(), PersistError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(self.path_for(&record.task_id), json).await?;
        Ok(())
    }
}

/// 内存实现：记录每次 save 的快照
#[derive(Debug, Default)]
pub struct InMemoryReasoningStore {
    saves: Mutex<HashMap<String, Vec<ReasoningRecord>>>,
}

impl InMemoryReasoningStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self, task_id: &str) -> usize {
        self.saves
            .lock()
            .map(|s| s.get(task_id).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn latest(&self, task_id: &str) -> Option<ReasoningRecord> {
        self.saves
            .lock()
            .ok()
            .and_then(|s| s.get(task_id).and_then(|v| v.last().cloned()))
    }
}

#[async_trait]
impl ReasoningStore for InMemoryReasoningStore {
    async fn save(&self, record: &ReasoningRecord) -> Result<(), PersistError> {
        let mut saves = self
            .saves
            .lock()
            .map_err(|_| PersistError::Unavailable("lock poisoned".to_string()))?;
        saves
            .entry(record.task_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::react::{ReasoningEntry, ReasoningPhase};

    fn record(task_id: &str, complete: bool) -> ReasoningRecord {
        ReasoningRecord {
            task_id: task_id.to_string(),
            user_id: "u1".to_string(),
            session_id: "s1".to_string(),
            complete,
            entries: vec![ReasoningEntry::new(
                Some(0),
                ReasoningPhase::PreStep,
                "look at the data",
                "dispatch generation",
            )],
        }
    }

    #[tokio::test]
    async fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileReasoningStore::new(dir.path().join("nested"));
        store.save(&record("t1", false)).await.unwrap();
        store.save(&record("t1", true)).await.unwrap();

        let loaded = store.load("t1").await.unwrap().unwrap();
        assert!(loaded.complete);
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.entries[0].action, "dispatch generation");
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_store_counts_saves() {
        let store = InMemoryReasoningStore::new();
        store.save(&record("t1", false)).await.unwrap();
        store.save(&record("t1", true)).await.unwrap();
        assert_eq!(store.save_count("t1"), 2);
        assert!(store.latest("t1").unwrap().complete);
        assert_eq!(store.save_count("t2"), 0);
    }

    #[tokio::test]
    async fn test_json_store_reports_io_error() {
        let dir = tempfile::tempdir().unwrap();
        // 目标目录位置被一个普通文件占用
        let blocked = dir.path().join("reasoning");
        std::fs::write(&blocked, "not a directory").unwrap();
        let store = JsonFileReasoningStore::new(&blocked);
        let err = store.save(&record("t1", false)).await.unwrap_err();
        assert!(matches!(err, PersistError::Io(_)), "{err:?}");
    }
}
