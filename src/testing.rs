//! In-memory doubles for the bus, store and probe.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::database::TaskStore;
use crate::error::{BusError, ProbeError, StoreError};
use crate::messaging::{Delivery, MessageBus};
use crate::models::{ConversionTask, TaskState};
use crate::probe::MediaProbe;
use crate::protocol::Message;

#[derive(Debug, Clone)]
pub struct Published {
  pub topic: String,
  pub delay: Option<Duration>,
  pub message: Message,
}

#[derive(Default)]
pub struct RecordingBus {
  published: Mutex<Vec<Published>>,
  /// Number of successful publishes before every later publish fails.
  fail_after: Mutex<Option<usize>>,
  attempts: AtomicUsize,
}

impl RecordingBus {
  pub fn failing_after(n: usize) -> Self {
    let bus = Self::default();
    *bus.fail_after.lock().unwrap() = Some(n);
    bus
  }

  pub fn heal(&self) {
    *self.fail_after.lock().unwrap() = None;
  }

  pub fn published(&self) -> Vec<Published> {
    self.published.lock().unwrap().clone()
  }

  pub fn to_topic(&self, topic: &str) -> Vec<Published> {
    self.published().into_iter().filter(|p| p.topic == topic).collect()
  }

  fn record(&self, topic: &str, delay: Option<Duration>, payload: &[u8]) -> Result<(), BusError> {
    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
    if let Some(limit) = *self.fail_after.lock().unwrap() {
      if attempt >= limit {
        return Err(BusError::Closed);
      }
    }
    let message = Message::decode(payload).expect("published payload decodes");
    self.published.lock().unwrap().push(Published { topic: topic.to_string(), delay, message });
    Ok(())
  }
}

#[async_trait]
impl MessageBus for RecordingBus {
  async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
    self.record(topic, None, payload)
  }

  async fn deferred_publish(&self, topic: &str, delay: Duration, payload: &[u8]) -> Result<(), BusError> {
    self.record(topic, Some(delay), payload)
  }
}

#[derive(Default)]
pub struct MemoryStore {
  tasks: Mutex<HashMap<String, ConversionTask>>,
  writes: AtomicUsize,
  failing: AtomicBool,
  /// Upcoming writes that fail before the store recovers.
  fail_next: AtomicUsize,
}

impl MemoryStore {
  pub fn failing() -> Self {
    let store = Self::default();
    store.failing.store(true, Ordering::SeqCst);
    store
  }

  pub fn fail_next(&self, writes: usize) {
    self.fail_next.store(writes, Ordering::SeqCst);
  }

  pub fn writes(&self) -> usize {
    self.writes.load(Ordering::SeqCst)
  }

  pub fn snapshot(&self, id: &str) -> Option<ConversionTask> {
    self.tasks.lock().unwrap().get(id).cloned()
  }
}

#[async_trait]
impl TaskStore for MemoryStore {
  async fn create_task(&self, task: &ConversionTask) -> Result<(), StoreError> {
    self.writes.fetch_add(1, Ordering::SeqCst);
    if self.failing.load(Ordering::SeqCst) {
      return Err(StoreError::Closed);
    }
    if self.fail_next.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
      return Err(StoreError::Closed);
    }
    self.tasks.lock().unwrap().insert(task.id.clone(), task.clone());
    Ok(())
  }

  async fn delete_task(&self, task: &ConversionTask) -> Result<(), StoreError> {
    self.tasks.lock().unwrap().remove(&task.id);
    Ok(())
  }

  async fn get_task(&self, id: &str) -> Result<Option<ConversionTask>, StoreError> {
    Ok(self.snapshot(id))
  }

  async fn tasks_in_state(&self, state: TaskState) -> Result<Vec<ConversionTask>, StoreError> {
    Ok(self.tasks.lock().unwrap().values().filter(|t| t.state == state).cloned().collect())
  }
}

pub struct StaticProbe(pub Result<f64, String>);

#[async_trait]
impl MediaProbe for StaticProbe {
  async fn duration(&self, path: &str) -> Result<f64, ProbeError> {
    self.0.clone().map_err(|reason| ProbeError::Failed { path: path.to_string(), reason })
  }
}

/// Takes `.0` to answer, then reports a one-minute file.
pub struct SlowProbe(pub Duration);

#[async_trait]
impl MediaProbe for SlowProbe {
  async fn duration(&self, _path: &str) -> Result<f64, ProbeError> {
    tokio::time::sleep(self.0).await;
    Ok(60.0)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
  Finished,
  Requeued(Duration),
}

pub struct TestDelivery {
  body: Vec<u8>,
  settlements: Mutex<Vec<Settlement>>,
}

impl TestDelivery {
  pub fn new(body: impl Into<Vec<u8>>) -> Self {
    Self { body: body.into(), settlements: Mutex::new(Vec::new()) }
  }

  pub fn of(message: &Message) -> Self {
    Self::new(message.encode().unwrap())
  }

  pub fn settlements(&self) -> Vec<Settlement> {
    self.settlements.lock().unwrap().clone()
  }
}

#[async_trait]
impl Delivery for TestDelivery {
  fn body(&self) -> &[u8] {
    &self.body
  }

  async fn finish(&self) -> Result<(), BusError> {
    self.settlements.lock().unwrap().push(Settlement::Finished);
    Ok(())
  }

  async fn requeue(&self, delay: Duration) -> Result<(), BusError> {
    self.settlements.lock().unwrap().push(Settlement::Requeued(delay));
    Ok(())
  }
}
