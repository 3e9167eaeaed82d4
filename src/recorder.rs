use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::node::JsonMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Fail,
}

/// Classification of a run by the kind of node it started from, kept for
/// parity with how downstream stores bucket their history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteType {
    OpenAi,
    Restful,
    Celery,
}

impl ExecuteType {
    pub fn from_kind(kind: &str) -> Self {
        match kind.to_ascii_lowercase().as_str() {
            "restful" => Self::Restful,
            "celery" => Self::Celery,
            _ => Self::OpenAi,
        }
    }
}

/// Snapshot of one finished run, success or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub flow_id: String,
    pub status: RunStatus,
    pub input_data: JsonMap,
    /// Per-node output data, keyed by node id.
    pub output_data: HashMap<String, Value>,
    pub last_output: String,
    pub execute_type: ExecuteType,
    pub recorded_at: DateTime<Utc>,
}

/// Sink for run history. Recording is best effort: the engine logs and
/// swallows errors from here, they never change a run's outcome.
#[async_trait]
pub trait RunRecorder: Send + Sync {
    async fn record(&self, record: &RunRecord) -> anyhow::Result<()>;
}

/// Recorder that drops everything.
pub struct NullRecorder;

#[async_trait]
impl RunRecorder for NullRecorder {
    async fn record(&self, _record: &RunRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-memory recorder, mainly for tests and local runs.
#[derive(Default)]
pub struct MemoryRecorder {
    records: Mutex<Vec<RunRecord>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<RunRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl RunRecorder for MemoryRecorder {
    async fn record(&self, record: &RunRecord) -> anyhow::Result<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}
