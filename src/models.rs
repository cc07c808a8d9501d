use std::collections::HashMap;

use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};

/// A conversion worker known to the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
  pub id: String,
  pub last_ping: DateTime<Utc>,
}

/// Identity payload carried by worker lifecycle messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRef {
  pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
  #[default]
  Pending,
  Dispatched,
  /// Set by the splitter once it picks the chunk up. The manager only reads it.
  Working,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
  pub sequence: u32,
  pub offset: f64,
  pub length: f64,
  #[serde(default)]
  pub file: String,
  #[serde(default)]
  pub status: ChunkStatus,
}

/// Where a task sits in the manager's lifecycle once it has been written to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
  #[default]
  Submitted,
  Retrying,
  Planned,
  Dispatched,
  Abandoned,
}

impl TaskState {
  pub fn as_str(&self) -> &'static str {
    match self {
      TaskState::Submitted => "submitted",
      TaskState::Retrying => "retrying",
      TaskState::Planned => "planned",
      TaskState::Dispatched => "dispatched",
      TaskState::Abandoned => "abandoned",
    }
  }
}

/// Retry bookkeeping that travels with a task across resubmissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
  pub attempts: u32,
  pub next_attempt_at: DateTime<Utc>,
  pub last_error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thumbnail {
  pub size: u32,
  pub quality: u8,
  pub seek: String,
  #[serde(alias = "ouput_file")]
  pub output_file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HttpCallbacks {
  #[serde(default)]
  pub before: String,
  #[serde(default)]
  pub after: String,
  #[serde(default)]
  pub error: String,
  #[serde(default)]
  pub progress: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConversionTask {
  #[serde(default)]
  pub id: String,
  #[serde(default)]
  pub producer_id: String,
  pub input_file: String,
  pub output_file: String,
  #[serde(default)]
  pub ffmpeg_args: HashMap<String, String>,
  #[serde(default)]
  pub thumbnails: Vec<Thumbnail>,
  #[serde(default)]
  pub callbacks: Option<HttpCallbacks>,
  #[serde(default)]
  pub chunks_length: f64,
  #[serde(default)]
  pub chunks: Vec<Chunk>,
  #[serde(default)]
  pub state: TaskState,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub retry: Option<RetryRecord>,
}

impl ConversionTask {
  pub fn pending_chunks(&self) -> impl Iterator<Item = &Chunk> {
    self.chunks.iter().filter(|c| c.status == ChunkStatus::Pending)
  }

  pub fn retry_attempts(&self) -> u32 {
    self.retry.as_ref().map(|r| r.attempts).unwrap_or(0)
  }
}

/// Work order sent to a splitter worker for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitTask {
  pub id: String,
  pub input_file: String,
  pub chunk: Chunk,
}

/// Progress report emitted by a splitter worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitEvent {
  pub id: String,
  #[serde(default)]
  pub chunk_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
  pub id: String,
}
