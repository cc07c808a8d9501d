//! The manager core: admits conversion tasks, plans chunks against the live worker pool,
//! persists the plan and hands every chunk to the splitter topic.
//!
//! Every retry goes through a deferred self-publish on the manager topic. The inbound
//! delivery is always finished; it is requeued on the bus only when that self-publish
//! could not be sent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Timing, Topics};
use crate::database::TaskStore;
use crate::error::OrchestratorError;
use crate::messaging::{Delivery, MessageBus};
use crate::models::{ChunkStatus, ConversionTask, RetryRecord, SplitTask, TaskRef, TaskState, WorkerRef};
use crate::planner;
use crate::probe::MediaProbe;
use crate::protocol::Message;
use crate::registry::{PingOutcome, WorkerRegistry};

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
  Dispatched { id: String, chunks: usize },
  /// No live workers; the task comes back on the manager topic after `retry_in`.
  Delayed { id: String, retry_in: Duration },
}

impl Admission {
  pub fn id(&self) -> &str {
    match self {
      Admission::Dispatched { id, .. } | Admission::Delayed { id, .. } => id,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Settle {
  Finish,
  Requeue(Duration),
}

pub struct Orchestrator {
  registry: Arc<WorkerRegistry>,
  store: Arc<dyn TaskStore>,
  probe: Arc<dyn MediaProbe>,
  bus: Arc<dyn MessageBus>,
  topics: Topics,
  timing: Timing,
}

impl Orchestrator {
  pub fn new(
    registry: Arc<WorkerRegistry>,
    store: Arc<dyn TaskStore>,
    probe: Arc<dyn MediaProbe>,
    bus: Arc<dyn MessageBus>,
    topics: Topics,
    timing: Timing,
  ) -> Self {
    Self { registry, store, probe, bus, topics, timing }
  }

  pub async fn create_task(&self, mut task: ConversionTask) -> Result<Admission, OrchestratorError> {
    if task.id.is_empty() {
      task.id = Uuid::new_v4().to_string();
    }
    task.chunks.clear();
    task.chunks_length = 0.0;
    task.state = TaskState::Submitted;

    let workers = self.registry.count().await;
    if workers == 0 {
      let delay = self.timing.no_capacity_delay;
      warn!("There are no active workers, task {} delayed by {:?}", task.id, delay);
      let id = task.id.clone();
      self.defer(task, delay).await?;
      return Ok(Admission::Delayed { id, retry_in: delay });
    }

    let duration = match self.probe.duration(&task.input_file).await {
      Ok(duration) => duration,
      Err(source) => {
        let err = OrchestratorError::Probe { task_id: task.id.clone(), source };
        return Err(self.reschedule(task, err).await);
      }
    };

    let plan = match planner::plan(workers, duration) {
      Ok(plan) => plan,
      Err(source) => {
        let err = OrchestratorError::Planning { task_id: task.id.clone(), source };
        return Err(self.reschedule(task, err).await);
      }
    };

    task.chunks_length = plan.chunk_length;
    task.chunks = plan.chunks;
    task.state = TaskState::Planned;
    if let Err(source) = self.store.create_task(&task).await {
      let err = OrchestratorError::Persistence { task_id: task.id.clone(), source };
      return Err(self.reschedule(task, err).await);
    }
    info!("Task {} planned: {} chunks of {}s from {}s of media", task.id, task.chunks.len(), task.chunks_length, duration);

    let chunks = self.dispatch(&mut task).await?;
    Ok(Admission::Dispatched { id: task.id, chunks })
  }

  /// Re-walks the chunks of a stored task that have not been published yet.
  pub async fn resume(&self, id: &str) -> Result<usize, OrchestratorError> {
    let mut task = self.store.get_task(id).await?.ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
    if task.state != TaskState::Planned {
      debug!("Task {} is {}, nothing to resume", id, task.state.as_str());
      return Ok(0);
    }
    self.dispatch(&mut task).await
  }

  /// Resumes every stored task whose dispatch did not complete. Run once at startup.
  pub async fn resume_pending(&self) -> Result<usize, OrchestratorError> {
    let tasks = self.store.tasks_in_state(TaskState::Planned).await?;
    let mut published = 0;
    for mut task in tasks {
      match self.dispatch(&mut task).await {
        Ok(n) => published += n,
        Err(e) => error!("Failed to resume task {}: {}", task.id, e),
      }
    }
    if published > 0 {
      info!("Resumed dispatch of {} chunks", published);
    }
    Ok(published)
  }

  pub async fn task_status(&self, id: &str) -> Result<Option<ConversionTask>, OrchestratorError> {
    Ok(self.store.get_task(id).await?)
  }

  /// Drops the stored record of a task. Chunks already handed to splitters are not recalled.
  pub async fn remove_task(&self, id: &str) -> Result<ConversionTask, OrchestratorError> {
    let task = self.store.get_task(id).await?.ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
    self.store.delete_task(&task).await?;
    info!("Task {} removed", id);
    Ok(task)
  }

  /// Publishes every pending chunk in sequence order, recording each one as dispatched.
  /// Stops at the first publish failure and schedules a resume of the remainder.
  async fn dispatch(&self, task: &mut ConversionTask) -> Result<usize, OrchestratorError> {
    let mut published = 0;
    let mut recorded = true;
    for idx in 0..task.chunks.len() {
      if task.chunks[idx].status != ChunkStatus::Pending {
        continue;
      }
      let split = SplitTask {
        id: task.id.clone(),
        input_file: task.input_file.clone(),
        chunk: task.chunks[idx].clone(),
      };
      let sequence = split.chunk.sequence;
      let payload = Message::ConversionSplit(split).encode()?;

      if let Err(source) = self.bus.publish(&self.topics.splitter, &payload).await {
        error!("Failed to publish chunk {} of task {}: {}", sequence, task.id, source);
        self.schedule_resume(&task.id).await;
        return Err(OrchestratorError::Dispatch { task_id: task.id.clone(), sequence, source });
      }
      debug!("Dispatched chunk {} of task {}", sequence, task.id);

      task.chunks[idx].status = ChunkStatus::Dispatched;
      published += 1;
      if task.pending_chunks().next().is_none() {
        task.state = TaskState::Dispatched;
      }
      // Every write carries the whole task, so only the latest one has to land.
      recorded = match self.store.create_task(task).await {
        Ok(()) => true,
        Err(e) => {
          warn!("Chunk {} of task {} dispatched but not recorded: {}", sequence, task.id, e);
          false
        }
      };
    }

    if !recorded {
      if let Err(e) = self.store.create_task(task).await {
        error!(
          "Task {} has {} published chunks the store does not know about, a restart will send them again: {}",
          task.id, published, e
        );
      }
    }

    if task.state == TaskState::Dispatched && published > 0 {
      info!("Task {} fully dispatched", task.id);
    }
    Ok(published)
  }

  async fn schedule_resume(&self, id: &str) {
    let delay = self.timing.no_capacity_delay;
    let resumed = Message::ConversionResume(TaskRef { id: id.to_string() }).encode();
    let sent = match resumed {
      Ok(payload) => self.bus.deferred_publish(&self.topics.manager, delay, &payload).await.map_err(OrchestratorError::from),
      Err(e) => Err(e.into()),
    };
    if let Err(e) = sent {
      error!("Could not schedule resume of task {}, it stays pending until restart: {}", id, e);
    }
  }

  async fn defer(&self, task: ConversionTask, delay: Duration) -> Result<(), OrchestratorError> {
    let id = task.id.clone();
    let payload = Message::ConversionPut(Box::new(task)).encode()?;
    self.bus
      .deferred_publish(&self.topics.manager, delay, &payload)
      .await
      .map_err(|source| OrchestratorError::Deferral { task_id: id, delay, source })
  }

  /// Records the failure on the task and resubmits it after the long backoff.
  /// Returns the error to report: `cause`, unless the retry itself could not be arranged.
  async fn reschedule(&self, mut task: ConversionTask, cause: OrchestratorError) -> OrchestratorError {
    let attempts = task.retry_attempts() + 1;
    let backoff = self.timing.retry_backoff;
    let last_error = cause.to_string();
    task.chunks.clear();
    task.chunks_length = 0.0;
    task.retry = Some(RetryRecord {
      attempts,
      next_attempt_at: Utc::now() + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::zero()),
      last_error: last_error.clone(),
    });

    let max = self.timing.max_retry_attempts;
    if max > 0 && attempts > max {
      task.state = TaskState::Abandoned;
      if let Err(e) = self.store.create_task(&task).await {
        error!("Failed to record abandoned task {}: {}", task.id, e);
      }
      error!("Task {} abandoned after {} attempts: {}", task.id, attempts, last_error);
      return OrchestratorError::RetriesExhausted { task_id: task.id, attempts, last_error };
    }

    task.state = TaskState::Retrying;
    if let Err(e) = self.store.create_task(&task).await {
      warn!("Failed to record retry of task {}: {}", task.id, e);
    }
    warn!("Task {} failed (attempt {}), retrying in {:?}: {}", task.id, attempts, backoff, last_error);
    match self.defer(task, backoff).await {
      Ok(()) => cause,
      Err(e) => e,
    }
  }

  /// Handles one inbound delivery and settles it exactly once.
  pub async fn handle_delivery(&self, delivery: &dyn Delivery) {
    let settle = match Message::decode(delivery.body()) {
      Ok(message) => {
        debug!("Got the message: {}", message.name());
        self.handle_message(message).await
      }
      Err(e) => {
        error!("Dropping undecodable message: {}", e);
        Settle::Finish
      }
    };

    let settled = match settle {
      Settle::Finish => delivery.finish().await,
      Settle::Requeue(delay) => delivery.requeue(delay).await,
    };
    if let Err(e) = settled {
      error!("Failed to settle delivery: {}", e);
    }
  }

  async fn handle_message(&self, message: Message) -> Settle {
    match message {
      Message::WorkerRegister(worker) => {
        self.register_worker(&worker.id).await;
        Settle::Finish
      }
      Message::WorkerPing(worker) => {
        if self.registry.ping(&worker.id, Utc::now()).await == PingOutcome::Registered {
          info!("Ping from unknown worker {}, registering", worker.id);
          self.send_registered(&worker.id).await;
        }
        Settle::Finish
      }
      Message::ConversionPut(task) => self.handle_put(*task).await,
      Message::ConversionResume(task) => {
        match self.resume(&task.id).await {
          Ok(n) => debug!("Resumed {} chunks of task {}", n, task.id),
          Err(e) => error!("Resume of task {} failed: {}", task.id, e),
        }
        Settle::Finish
      }
      Message::SplitterStart(event) => {
        info!("Splitter started {} for task {}", event.chunk_file, event.id);
        Settle::Finish
      }
      Message::SplitterFinish(event) => {
        info!("Splitter finished {} for task {}", event.chunk_file, event.id);
        Settle::Finish
      }
      unexpected @ (Message::WorkerRegistered(_) | Message::ConversionSplit(_)) => {
        warn!("Ignoring {} on the manager topic", unexpected.name());
        Settle::Finish
      }
    }
  }

  /// A `conversion:put` that already carries an id is either a retry or a redelivery.
  /// The stored record decides: a task already planned only gets its remaining chunks,
  /// and a task past dispatch is left alone.
  async fn handle_put(&self, task: ConversionTask) -> Settle {
    if !task.id.is_empty() {
      match self.store.get_task(&task.id).await {
        Ok(Some(mut stored)) => match stored.state {
          TaskState::Planned => {
            match self.dispatch(&mut stored).await {
              Ok(n) => info!("Task {} was already planned, resumed {} chunks", stored.id, n),
              Err(e) => error!("{}", e),
            }
            return Settle::Finish;
          }
          TaskState::Dispatched | TaskState::Abandoned => {
            info!("Task {} is already {}, ignoring resubmission", stored.id, stored.state.as_str());
            return Settle::Finish;
          }
          TaskState::Submitted | TaskState::Retrying => {}
        },
        Ok(None) => {}
        Err(source) => {
          let err = OrchestratorError::Persistence { task_id: task.id.clone(), source };
          return Self::settle_admission(Err(self.reschedule(task, err).await));
        }
      }
    }
    Self::settle_admission(self.create_task(task).await)
  }

  fn settle_admission(admission: Result<Admission, OrchestratorError>) -> Settle {
    match admission {
      Ok(Admission::Dispatched { id, chunks }) => {
        info!("Task {} dispatched in {} chunks", id, chunks);
        Settle::Finish
      }
      Ok(Admission::Delayed { .. }) => Settle::Finish,
      Err(OrchestratorError::Deferral { task_id, delay, source }) => {
        error!("Could not defer task {}, requeueing the delivery: {}", task_id, source);
        Settle::Requeue(delay)
      }
      Err(e) => {
        error!("{}", e);
        Settle::Finish
      }
    }
  }

  async fn register_worker(&self, id: &str) {
    info!("Registering worker {}", id);
    self.registry.register(id, Utc::now()).await;
    self.send_registered(id).await;
  }

  async fn send_registered(&self, id: &str) {
    let reply = Message::WorkerRegistered(WorkerRef { id: id.to_string() });
    let sent = match reply.encode() {
      Ok(payload) => self.bus.publish(&self.topics.worker(id), &payload).await.map_err(OrchestratorError::from),
      Err(e) => Err(e.into()),
    };
    if let Err(e) = sent {
      error!("Failed to confirm registration of worker {}: {}", id, e);
    }
  }
}
