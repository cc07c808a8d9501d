use std::convert::Infallible;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use warp::Filter;
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use tracing::{info, error};

use crate::error::OrchestratorError;
use crate::models::ConversionTask;
use crate::orchestrator::{Admission, Orchestrator};

#[derive(Serialize)]
pub struct TaskResponse {
  pub task_id: String,
  pub status: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub chunks: Option<usize>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub retry_in_secs: Option<u64>,
  pub status_url: String,
}

impl From<Admission> for TaskResponse {
  fn from(admission: Admission) -> Self {
    let status_url = format!("/tasks/{}", admission.id());
    match admission {
      Admission::Dispatched { id, chunks } => Self {
        task_id: id,
        status: "dispatched".into(),
        chunks: Some(chunks),
        retry_in_secs: None,
        status_url,
      },
      Admission::Delayed { id, retry_in } => Self {
        task_id: id,
        status: "delayed".into(),
        chunks: None,
        retry_in_secs: Some(retry_in.as_secs()),
        status_url,
      },
    }
  }
}

fn validate_task(task: &ConversionTask) -> Result<(), String> {
  for (field, value) in [("input_file", &task.input_file), ("output_file", &task.output_file)] {
    if value.trim().is_empty() {
      return Err(format!("Missing field '{}'", field));
    }
  }
  Ok(())
}

fn error_reply(message: String, status: StatusCode) -> WithStatus<Json> {
  warp::reply::with_status(warp::reply::json(&json!({ "error": message })), status)
}

fn with_orchestrator(orchestrator: Arc<Orchestrator>) -> impl Filter<Extract = (Arc<Orchestrator>,), Error = Infallible> + Clone {
  warp::any().map(move || orchestrator.clone())
}

pub fn submit_route(orchestrator: Arc<Orchestrator>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("tasks")
    .and(warp::path::end())
    .and(warp::put().or(warp::post()).unify())
    .and(warp::body::json())
    .and(with_orchestrator(orchestrator))
    .and_then(handle_submit_task)
}

pub fn status_route(orchestrator: Arc<Orchestrator>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("tasks" / String)
    .and(warp::get())
    .and(with_orchestrator(orchestrator))
    .and_then(handle_task_status)
}

pub fn delete_route(orchestrator: Arc<Orchestrator>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("tasks" / String)
    .and(warp::delete())
    .and(with_orchestrator(orchestrator))
    .and_then(handle_delete_task)
}

async fn handle_submit_task(mut task: ConversionTask, orchestrator: Arc<Orchestrator>) -> Result<WithStatus<Json>, Infallible> {
  if let Err(e) = validate_task(&task) {
    error!("Task validation failed: {}", e);
    return Ok(error_reply(e, StatusCode::BAD_REQUEST));
  }
  // Ids are minted here; a client-supplied one is never trusted.
  task.id.clear();

  match orchestrator.create_task(task).await {
    Ok(admission) => {
      info!("Task {} submitted", admission.id());
      let response = TaskResponse::from(admission);
      Ok(warp::reply::with_status(warp::reply::json(&response), StatusCode::OK))
    }
    Err(e) => {
      error!("Task submission failed: {}", e);
      Ok(error_reply(e.to_string(), StatusCode::BAD_REQUEST))
    }
  }
}

async fn handle_task_status(task_id: String, orchestrator: Arc<Orchestrator>) -> Result<WithStatus<Json>, Infallible> {
  match orchestrator.task_status(&task_id).await {
    Ok(Some(task)) => Ok(warp::reply::with_status(warp::reply::json(&task), StatusCode::OK)),
    Ok(None) => Ok(error_reply(format!("Task {} not found", task_id), StatusCode::NOT_FOUND)),
    Err(e) => {
      error!("Failed to fetch task {}: {}", task_id, e);
      Ok(error_reply("An error occurred when fetching the task.".into(), StatusCode::INTERNAL_SERVER_ERROR))
    }
  }
}

async fn handle_delete_task(task_id: String, orchestrator: Arc<Orchestrator>) -> Result<WithStatus<Json>, Infallible> {
  match orchestrator.remove_task(&task_id).await {
    Ok(task) => Ok(warp::reply::with_status(warp::reply::json(&task), StatusCode::OK)),
    Err(OrchestratorError::NotFound(_)) => Ok(error_reply(format!("Task {} not found", task_id), StatusCode::NOT_FOUND)),
    Err(e) => {
      error!("Failed to delete task {}: {}", task_id, e);
      Ok(error_reply("An error occurred when deleting the task.".into(), StatusCode::INTERNAL_SERVER_ERROR))
    }
  }
}
