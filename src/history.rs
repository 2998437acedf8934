//! Conversation history store
//!
//! The relay writes exactly one `ExchangeRecord` per completed invocation:
//! the user prompt together with the assembled answer. Reads are only
//! offered for inspection; the store itself is owned elsewhere.

use crate::error::{RelayError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

/// One prompt/answer exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRecord {
    pub session_id: String,
    pub user_id: String,
    pub message_id: String,
    pub user_prompt: String,
    pub assistant_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<serde_json::Value>,
    pub runtime_identifier: String,
    pub qualifier: String,
    pub recorded_at: DateTime<Utc>,
}

/// Append target for completed exchanges
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append one exchange
    async fn append(&self, record: ExchangeRecord) -> Result<()>;

    /// Exchanges of a session, oldest first
    async fn session(&self, session_id: &str) -> Result<Vec<ExchangeRecord>>;
}

/// In-memory history store for testing
#[derive(Default)]
pub struct MemoryHistoryStore {
    sessions: RwLock<HashMap<String, Vec<ExchangeRecord>>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total appends across all sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, record: ExchangeRecord) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(record.session_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn session(&self, session_id: &str) -> Result<Vec<ExchangeRecord>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).cloned().unwrap_or_default())
    }
}

/// JSON-lines file history store
///
/// One record per line, appended in place. Parent directories are
/// created on first write.
pub struct FileHistoryStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileHistoryStore {
    /// Create a new file history store at the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn append(&self, record: ExchangeRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RelayError::History(format!(
                    "Failed to create history directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                RelayError::History(format!(
                    "Failed to open history file {}: {}",
                    self.path.display(),
                    e
                ))
            })?;

        file.write_all(&line).map_err(|e| {
            RelayError::History(format!(
                "Failed to append to history file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(
            path = %self.path.display(),
            session_id = %record.session_id,
            message_id = %record.message_id,
            "Exchange appended"
        );
        Ok(())
    }

    async fn session(&self, session_id: &str) -> Result<Vec<ExchangeRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let _guard = self.write_lock.lock().await;
        let file = std::fs::File::open(&self.path).map_err(|e| {
            RelayError::History(format!(
                "Failed to read history file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let mut records = Vec::new();
        for line in std::io::BufReader::new(file).lines() {
            let line = line.map_err(|e| RelayError::History(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: ExchangeRecord = serde_json::from_str(&line)?;
            if record.session_id == session_id {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(session_id: &str, message_id: &str) -> ExchangeRecord {
        ExchangeRecord {
            session_id: session_id.to_string(),
            user_id: "u-1".to_string(),
            message_id: message_id.to_string(),
            user_prompt: "What's the weather in Paris?".to_string(),
            assistant_content: "It is sunny.".to_string(),
            reasoning_content: None,
            references: Some(serde_json::json!([{"uri": "s3://kb/weather.md"}])),
            runtime_identifier: "rt-1".to_string(),
            qualifier: "DEFAULT".to_string(),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_append_and_read() {
        let store = MemoryHistoryStore::new();
        assert!(store.is_empty().await);

        store.append(record("s-1", "m-1")).await.unwrap();
        store.append(record("s-2", "m-2")).await.unwrap();
        store.append(record("s-1", "m-3")).await.unwrap();

        assert_eq!(store.len().await, 3);
        let session = store.session("s-1").await.unwrap();
        assert_eq!(session.len(), 2);
        assert_eq!(session[1].message_id, "m-3");
        assert!(store.session("s-9").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_appends_lines() {
        let dir = std::env::temp_dir().join(format!(
            "a3s-relay-test-{}/nested",
            uuid::Uuid::new_v4()
        ));
        let path = dir.join("history.jsonl");
        let store = FileHistoryStore::new(&path);

        store.append(record("s-1", "m-1")).await.unwrap();
        store.append(record("s-2", "m-2")).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("\"assistantContent\":\"It is sunny.\""));

        let session = store.session("s-2").await.unwrap();
        assert_eq!(session.len(), 1);
        assert_eq!(session[0].references.as_ref().unwrap()[0]["uri"], "s3://kb/weather.md");

        std::fs::remove_dir_all(dir.parent().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_file_store_missing_file_reads_empty() {
        let store = FileHistoryStore::new("/tmp/nonexistent-a3s-relay-history.jsonl");
        assert!(store.session("s-1").await.unwrap().is_empty());
        assert_eq!(
            store.path(),
            Path::new("/tmp/nonexistent-a3s-relay-history.jsonl")
        );
    }
}
