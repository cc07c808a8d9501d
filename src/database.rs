use async_trait::async_trait;
use chrono::Utc;
use sqlx::migrate::Migrator;
use sqlx::{PgPool, Pool, Postgres, Row};
use tracing::info;

use crate::error::StoreError;
use crate::models::{ConversionTask, TaskState};

static MIGRATOR: Migrator = sqlx::migrate!();

/// Durable task records keyed by task id.
///
/// Writes return only once the record is committed.
#[async_trait]
pub trait TaskStore: Send + Sync {
  /// Inserts or overwrites the record for `task.id`.
  async fn create_task(&self, task: &ConversionTask) -> Result<(), StoreError>;

  async fn delete_task(&self, task: &ConversionTask) -> Result<(), StoreError>;

  async fn get_task(&self, id: &str) -> Result<Option<ConversionTask>, StoreError>;

  async fn tasks_in_state(&self, state: TaskState) -> Result<Vec<ConversionTask>, StoreError>;
}

pub struct PgTaskStore {
  pool: PgPool,
}

impl PgTaskStore {
  /// Connects and provisions the task keyspace if it does not exist yet.
  pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
    let pool = Pool::<Postgres>::connect(database_url).await?;
    MIGRATOR.run(&pool).await?;
    info!("Database migrations complete");
    Ok(Self { pool })
  }

  pub async fn close(&self) {
    self.pool.close().await;
    info!("Task store closed");
  }

  fn decode(body: &str) -> Result<ConversionTask, StoreError> {
    Ok(serde_json::from_str(body)?)
  }
}

#[async_trait]
impl TaskStore for PgTaskStore {
  async fn create_task(&self, task: &ConversionTask) -> Result<(), StoreError> {
    if self.pool.is_closed() {
      return Err(StoreError::Closed);
    }
    let body = serde_json::to_string(task)?;
    sqlx::query(
      "INSERT INTO tasks (id, state, body, updated_at) VALUES ($1, $2, $3, $4)
       ON CONFLICT (id) DO UPDATE SET state = EXCLUDED.state, body = EXCLUDED.body, updated_at = EXCLUDED.updated_at",
    )
      .bind(&task.id)
      .bind(task.state.as_str())
      .bind(body)
      .bind(Utc::now())
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn delete_task(&self, task: &ConversionTask) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM tasks WHERE id = $1")
      .bind(&task.id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn get_task(&self, id: &str) -> Result<Option<ConversionTask>, StoreError> {
    let row = sqlx::query("SELECT body FROM tasks WHERE id = $1")
      .bind(id)
      .fetch_optional(&self.pool)
      .await?;
    row.map(|r| Self::decode(&r.get::<String, _>("body"))).transpose()
  }

  async fn tasks_in_state(&self, state: TaskState) -> Result<Vec<ConversionTask>, StoreError> {
    let rows = sqlx::query("SELECT body FROM tasks WHERE state = $1 ORDER BY updated_at")
      .bind(state.as_str())
      .fetch_all(&self.pool)
      .await?;
    rows.iter().map(|r| Self::decode(&r.get::<String, _>("body"))).collect()
  }
}
