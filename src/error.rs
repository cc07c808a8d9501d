use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
  #[error("cannot plan chunks without live workers")]
  NoWorkers,

  #[error("invalid media duration: {0}")]
  InvalidDuration(f64),

  #[error("computed chunk length is zero (duration {duration}s over {workers} workers)")]
  ZeroChunkLength { duration: f64, workers: usize },
}

#[derive(Debug, Error)]
pub enum ProbeError {
  #[error("ffprobe binary not found at {0}")]
  NotFound(PathBuf),

  #[error("probe of {path} failed: {reason}")]
  Failed { path: String, reason: String },

  #[error("probe of {path} timed out after {timeout:?}")]
  Timeout { path: String, timeout: Duration },

  #[error("probe output for {path} has no usable duration")]
  MissingDuration { path: String },

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("migration error: {0}")]
  Migration(#[from] sqlx::migrate::MigrateError),

  #[error("task encoding error: {0}")]
  Encoding(#[from] serde_json::Error),

  #[error("task store is closed")]
  Closed,
}

#[derive(Debug, Error)]
pub enum BusError {
  #[error("amqp error: {0}")]
  Amqp(#[from] lapin::Error),

  #[error("publish to {topic} was not confirmed")]
  NotConfirmed { topic: String },

  #[error("bus is closed")]
  Closed,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
  #[error("malformed envelope: {0}")]
  Malformed(#[source] serde_json::Error),

  #[error("malformed payload for {name}: {source}")]
  MalformedPayload {
    name: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("unknown message tag: {0}")]
  UnknownTag(String),

  #[error("invalid worker id: {0:?}")]
  InvalidWorkerId(String),

  #[error("failed to encode {name}: {source}")]
  Encode {
    name: &'static str,
    #[source]
    source: serde_json::Error,
  },
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
  #[error("probe failed for task {task_id}: {source}")]
  Probe {
    task_id: String,
    #[source]
    source: ProbeError,
  },

  #[error("planning failed for task {task_id}: {source}")]
  Planning {
    task_id: String,
    #[source]
    source: PlanError,
  },

  #[error("failed to persist task {task_id}: {source}")]
  Persistence {
    task_id: String,
    #[source]
    source: StoreError,
  },

  #[error("dispatch of task {task_id} stopped at chunk {sequence}: {source}")]
  Dispatch {
    task_id: String,
    sequence: u32,
    #[source]
    source: BusError,
  },

  #[error("could not defer task {task_id} by {delay:?}: {source}")]
  Deferral {
    task_id: String,
    delay: Duration,
    #[source]
    source: BusError,
  },

  #[error("task {task_id} abandoned after {attempts} attempts: {last_error}")]
  RetriesExhausted {
    task_id: String,
    attempts: u32,
    last_error: String,
  },

  #[error("task {0} not found")]
  NotFound(String),

  #[error(transparent)]
  Protocol(#[from] ProtocolError),

  #[error(transparent)]
  Bus(#[from] BusError),

  #[error(transparent)]
  Store(#[from] StoreError),
}
