use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vconvd::{
  config::Config,
  consumer,
  database::PgTaskStore,
  messaging::AmqpBus,
  orchestrator::Orchestrator,
  probe::FfprobeProbe,
  registry::WorkerRegistry,
  routes::routes,
  shutdown::wait_for_shutdown_signal,
};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();
  let config = Config::from_env()?;
  info!("Starting manager");

  let store = Arc::new(PgTaskStore::connect(&config.database_url).await.context("failed to open task store")?);
  let bus = AmqpBus::connect(&config.rabbitmq_url).await.context("failed to connect to RabbitMQ")?;
  bus.declare_topic(&config.topics.splitter).await?;

  let registry = Arc::new(WorkerRegistry::new());
  let probe = Arc::new(FfprobeProbe::new(&config.ffprobe_path, config.probe_timeout));
  let orchestrator = Arc::new(Orchestrator::new(
    registry.clone(),
    store.clone(),
    probe,
    Arc::new(bus.clone()),
    config.topics.clone(),
    config.timing.clone(),
  ));

  if let Err(e) = orchestrator.resume_pending().await {
    error!("Failed to resume pending tasks: {}", e);
  }

  let shutdown = CancellationToken::new();
  let sweeper = registry.spawn_sweeper(config.timing.sweep_interval, config.timing.liveness_timeout, shutdown.clone());

  let deliveries = bus.consume(&config.topics.manager, "vconvd-manager", config.prefetch).await?;
  let consumer = tokio::spawn(consumer::run(orchestrator.clone(), deliveries, config.max_in_flight, shutdown.clone()));

  let addr = SocketAddr::new(config.server_host, config.server_port);
  let server_shutdown = shutdown.clone();
  let (bound, server) = warp::serve(routes(orchestrator))
    .try_bind_with_graceful_shutdown(addr, async move { server_shutdown.cancelled().await })
    .with_context(|| format!("failed to bind {}", addr))?;
  info!("Listening on {}", bound);
  let server = tokio::spawn(server);

  wait_for_shutdown_signal().await?;
  info!("Shutting down");
  shutdown.cancel();

  server.await?;
  consumer.await?;
  sweeper.await?;

  if let Err(e) = bus.close().await {
    error!("Failed to close RabbitMQ connection: {}", e);
  }
  store.close().await;

  info!("Gracefully stopped");
  Ok(())
}
