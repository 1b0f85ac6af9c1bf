//! Record sink interface
//!
//! New and updated records leave the crawler through a [`RecordSink`]. What
//! happens to them afterwards (indexing, storage, notifications) is the
//! sink's business.

use crate::state::ChangeKind;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Errors that can occur while handing records to a sink
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to write record: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sink unavailable: {0}")]
    Unavailable(String),
}

/// A record handed to the sink
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedRecord {
    pub domain: String,
    pub url: String,
    pub fields: BTreeMap<String, String>,
    pub change_kind: ChangeKind,
}

/// Downstream consumer of extracted records
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Delivers one record
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The record was accepted
    /// * `Ok(false)` - The sink declined the record
    /// * `Err(SinkError)` - Delivery failed
    async fn emit(&self, record: &ExtractedRecord) -> Result<bool, SinkError>;
}

/// Appends one JSON object per line to a file
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    /// Opens (or creates) the output file in append mode
    pub async fn open(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        tracing::debug!("Opened record sink at {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSink for JsonLinesSink {
    async fn emit(&self, record: &ExtractedRecord) -> Result<bool, SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        // One write per record keeps lines whole under concurrent emitters
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(true)
    }
}

/// Keeps records in memory, in emission order
///
/// Useful when embedding the orchestrator in another program.
#[derive(Default)]
pub struct MemorySink {
    records: std::sync::Mutex<Vec<ExtractedRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything emitted so far
    pub fn records(&self) -> Vec<ExtractedRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn emit(&self, record: &ExtractedRecord) -> Result<bool, SinkError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| SinkError::Unavailable("record buffer poisoned".to_string()))?;
        records.push(record.clone());
        Ok(true)
    }
}
