use std::sync::Arc;

use warp::Filter;

use crate::orchestrator::Orchestrator;

pub mod tasks;

pub fn routes(
  orchestrator: Arc<Orchestrator>
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  tasks::submit_route(orchestrator.clone())
    .or(tasks::status_route(orchestrator.clone()))
    .or(tasks::delete_route(orchestrator))
}
