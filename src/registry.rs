//! Live conversion workers, kept alive by heartbeats and evicted by a periodic sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::models::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
  Refreshed,
  /// The worker was unknown and has been registered by this ping.
  Registered,
}

pub struct WorkerRegistry {
  workers: Mutex<HashMap<String, Worker>>,
}

impl WorkerRegistry {
  pub fn new() -> Self {
    Self {
      workers: Mutex::new(HashMap::new()),
    }
  }

  pub async fn register(&self, id: &str, now: DateTime<Utc>) {
    let worker = Worker { id: id.to_string(), last_ping: now };
    self.workers.lock().await.insert(worker.id.clone(), worker);
  }

  pub async fn ping(&self, id: &str, now: DateTime<Utc>) -> PingOutcome {
    let mut workers = self.workers.lock().await;
    match workers.get_mut(id) {
      Some(worker) => {
        worker.last_ping = now;
        PingOutcome::Refreshed
      }
      None => {
        workers.insert(id.to_string(), Worker { id: id.to_string(), last_ping: now });
        PingOutcome::Registered
      }
    }
  }

  /// Removes every worker silent for longer than `timeout`; returns the evicted IDs.
  pub async fn sweep(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
    let mut workers = self.workers.lock().await;
    let expired: Vec<String> = workers
      .values()
      .filter(|w| (now - w.last_ping).to_std().map(|idle| idle > timeout).unwrap_or(false))
      .map(|w| w.id.clone())
      .collect();
    for id in &expired {
      workers.remove(id);
    }
    expired
  }

  pub async fn count(&self) -> usize {
    self.workers.lock().await.len()
  }

  pub async fn get(&self, id: &str) -> Option<Worker> {
    self.workers.lock().await.get(id).cloned()
  }

  /// Runs `sweep` every `interval` until `shutdown` fires.
  pub fn spawn_sweeper(
    self: Arc<Self>,
    interval: Duration,
    timeout: Duration,
    shutdown: CancellationToken,
  ) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        tokio::select! {
          _ = shutdown.cancelled() => break,
          _ = ticker.tick() => {
            for id in self.sweep(Utc::now(), timeout).await {
              info!("Unregistering worker {} after {:?} without ping", id, timeout);
            }
          }
        }
      }
      debug!("Worker sweeper stopped");
    })
  }
}

impl Default for WorkerRegistry {
  fn default() -> Self {
    Self::new()
  }
}
