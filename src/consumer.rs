use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::messaging::DeliveryStream;
use crate::orchestrator::Orchestrator;
use crate::protocol;

/// Feeds inbound deliveries to the orchestrator, each on its own task. At most
/// `max_in_flight` task admissions run at once; registry traffic never waits for them.
/// Returns once `shutdown` fires (or the stream ends) and every handler has settled its delivery.
pub async fn run(
  orchestrator: Arc<Orchestrator>,
  mut deliveries: DeliveryStream,
  max_in_flight: usize,
  shutdown: CancellationToken,
) {
  let admissions = Arc::new(Semaphore::new(max_in_flight.max(1)));
  let handlers = TaskTracker::new();

  loop {
    let next = tokio::select! {
      _ = shutdown.cancelled() => break,
      next = deliveries.next() => next,
    };

    match next {
      Some(Ok(delivery)) => {
        let orchestrator = orchestrator.clone();
        let limiter = protocol::is_admission(delivery.body()).then(|| admissions.clone());
        handlers.spawn(async move {
          let _permit = match limiter {
            Some(limiter) => limiter.acquire_owned().await.ok(),
            None => None,
          };
          orchestrator.handle_delivery(delivery.as_ref()).await;
        });
      }
      Some(Err(e)) => error!("Consumer error: {:?}", e),
      None => {
        warn!("Inbound delivery stream closed");
        break;
      }
    }
  }

  drop(deliveries);
  handlers.close();
  handlers.wait().await;
  info!("Inbound message handling drained");
}
