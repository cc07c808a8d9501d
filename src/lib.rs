pub mod config;
pub mod consumer;
pub mod database;
pub mod error;
pub mod messaging;
pub mod models;
pub mod orchestrator;
pub mod planner;
pub mod probe;
pub mod protocol;
pub mod registry;
pub mod routes;
pub mod shutdown;

#[cfg(test)]
pub(crate) mod testing;
