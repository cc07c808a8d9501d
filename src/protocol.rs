//! Message envelope exchanged over the bus: `{"name": <tag>, "data": <payload>}`.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Serialize, Deserialize};
use serde::de::DeserializeOwned;

use crate::error::ProtocolError;
use crate::models::{ConversionTask, SplitEvent, SplitTask, TaskRef, WorkerRef};

pub const WORKER_REGISTER: &str = "conversion-worker:register";
pub const WORKER_REGISTERED: &str = "conversion-worker:registered";
pub const WORKER_PING: &str = "conversion-worker:ping";
pub const CONVERSION_PUT: &str = "conversion:put";
pub const CONVERSION_SPLIT: &str = "conversion:split";
pub const CONVERSION_RESUME: &str = "conversion:resume";
pub const SPLITTER_START: &str = "splitter-worker:start";
pub const SPLITTER_FINISH: &str = "splitter-worker:finish";

// Worker ids end up in topic names.
static WORKER_ID: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^[A-Za-z0-9._:-]{1,128}$").expect("worker id pattern is valid")
});

#[derive(Serialize, Deserialize)]
struct Envelope {
  name: String,
  #[serde(default)]
  data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
  WorkerRegister(WorkerRef),
  WorkerRegistered(WorkerRef),
  WorkerPing(WorkerRef),
  ConversionPut(Box<ConversionTask>),
  ConversionSplit(SplitTask),
  ConversionResume(TaskRef),
  SplitterStart(SplitEvent),
  SplitterFinish(SplitEvent),
}

impl Message {
  pub fn name(&self) -> &'static str {
    match self {
      Message::WorkerRegister(_) => WORKER_REGISTER,
      Message::WorkerRegistered(_) => WORKER_REGISTERED,
      Message::WorkerPing(_) => WORKER_PING,
      Message::ConversionPut(_) => CONVERSION_PUT,
      Message::ConversionSplit(_) => CONVERSION_SPLIT,
      Message::ConversionResume(_) => CONVERSION_RESUME,
      Message::SplitterStart(_) => SPLITTER_START,
      Message::SplitterFinish(_) => SPLITTER_FINISH,
    }
  }

  pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
    let name = self.name();
    let data = match self {
      Message::WorkerRegister(w) | Message::WorkerRegistered(w) | Message::WorkerPing(w) => serde_json::to_value(w),
      Message::ConversionPut(task) => serde_json::to_value(task),
      Message::ConversionSplit(split) => serde_json::to_value(split),
      Message::ConversionResume(task) => serde_json::to_value(task),
      Message::SplitterStart(ev) | Message::SplitterFinish(ev) => serde_json::to_value(ev),
    }
    .map_err(|source| ProtocolError::Encode { name, source })?;

    serde_json::to_vec(&Envelope { name: name.to_string(), data })
      .map_err(|source| ProtocolError::Encode { name, source })
  }

  pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
    let envelope: Envelope = serde_json::from_slice(bytes).map_err(ProtocolError::Malformed)?;
    let Envelope { name, data } = envelope;

    let message = match name.as_str() {
      WORKER_REGISTER => Message::WorkerRegister(worker(&name, data)?),
      WORKER_REGISTERED => Message::WorkerRegistered(worker(&name, data)?),
      WORKER_PING => Message::WorkerPing(worker(&name, data)?),
      CONVERSION_PUT => Message::ConversionPut(Box::new(payload(&name, data)?)),
      CONVERSION_SPLIT => Message::ConversionSplit(payload(&name, data)?),
      CONVERSION_RESUME => Message::ConversionResume(payload(&name, data)?),
      SPLITTER_START => Message::SplitterStart(payload(&name, data)?),
      SPLITTER_FINISH => Message::SplitterFinish(payload(&name, data)?),
      _ => return Err(ProtocolError::UnknownTag(name)),
    };
    Ok(message)
  }
}

pub fn is_valid_worker_id(id: &str) -> bool {
  WORKER_ID.is_match(id)
}

/// True when `bytes` carries a `conversion:put`, read from the envelope name alone.
pub fn is_admission(bytes: &[u8]) -> bool {
  #[derive(Deserialize)]
  struct Name {
    name: String,
  }

  serde_json::from_slice::<Name>(bytes).is_ok_and(|envelope| envelope.name == CONVERSION_PUT)
}

fn payload<T: DeserializeOwned>(name: &str, data: serde_json::Value) -> Result<T, ProtocolError> {
  serde_json::from_value(data).map_err(|source| ProtocolError::MalformedPayload { name: name.to_string(), source })
}

fn worker(name: &str, data: serde_json::Value) -> Result<WorkerRef, ProtocolError> {
  let worker: WorkerRef = payload(name, data)?;
  if !is_valid_worker_id(&worker.id) {
    return Err(ProtocolError::InvalidWorkerId(worker.id));
  }
  Ok(worker)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{Chunk, ChunkStatus};

  #[test]
  fn admissions_are_told_apart_by_name() {
    let put = Message::ConversionPut(Box::default()).encode().unwrap();
    let ping = Message::WorkerPing(WorkerRef { id: "w1".into() }).encode().unwrap();
    assert!(is_admission(&put));
    assert!(!is_admission(&ping));
    assert!(!is_admission(b"not json"));
  }

  #[test]
  fn decodes_worker_register() {
    let msg = Message::decode(br#"{"name":"conversion-worker:register","data":{"id":"w-1"}}"#).unwrap();
    assert_eq!(msg, Message::WorkerRegister(WorkerRef { id: "w-1".into() }));
  }

  #[test]
  fn split_task_keeps_its_tag_and_chunk() {
    let split = SplitTask {
      id: "t-1".into(),
      input_file: "/in.mkv".into(),
      chunk: Chunk { sequence: 2, offset: 25.0, length: 24.0, file: String::new(), status: ChunkStatus::Pending },
    };
    let bytes = Message::ConversionSplit(split.clone()).encode().unwrap();
    let raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(raw["name"], "conversion:split");
    assert_eq!(raw["data"]["chunk"]["sequence"], 2);
    assert_eq!(Message::decode(&bytes).unwrap(), Message::ConversionSplit(split));
  }

  #[test]
  fn unknown_tag_is_reported() {
    let err = Message::decode(br#"{"name":"joiner:finish","data":{}}"#).unwrap_err();
    assert!(matches!(err, ProtocolError::UnknownTag(name) if name == "joiner:finish"));
  }

  #[test]
  fn garbage_is_malformed() {
    assert!(matches!(Message::decode(b"\x93\x01\x02"), Err(ProtocolError::Malformed(_))));
  }

  #[test]
  fn wrong_payload_shape_is_malformed() {
    let err = Message::decode(br#"{"name":"conversion:put","data":{"id":5}}"#).unwrap_err();
    assert!(matches!(err, ProtocolError::MalformedPayload { .. }));
  }

  #[test]
  fn rejects_worker_ids_unsafe_for_topics() {
    let err = Message::decode(br#"{"name":"conversion-worker:ping","data":{"id":"a b/c"}}"#).unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidWorkerId(_)));
    assert!(is_valid_worker_id("conv-worker.7"));
    assert!(!is_valid_worker_id(""));
  }
}
