use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use lapin::{Connection, ConnectionProperties, Channel, BasicProperties};
use lapin::message::Delivery as AmqpMessage;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use tokio::sync::Mutex;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info};

use crate::error::BusError;

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;
const PERSISTENT: u8 = 2;

/// Producer side of the message bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
  async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError>;

  /// Delivers `payload` to `topic` once `delay` has elapsed.
  async fn deferred_publish(&self, topic: &str, delay: Duration, payload: &[u8]) -> Result<(), BusError>;
}

/// One received message. Must be settled exactly once, by `finish` or `requeue`.
#[async_trait]
pub trait Delivery: Send + Sync {
  fn body(&self) -> &[u8];

  async fn finish(&self) -> Result<(), BusError>;

  /// Settles this delivery and has the same body redelivered after `delay`.
  async fn requeue(&self, delay: Duration) -> Result<(), BusError>;
}

pub type DeliveryStream = BoxStream<'static, Result<Box<dyn Delivery>, BusError>>;

/// RabbitMQ-backed bus. Topics map to durable queues on the default exchange;
/// deferred delivery parks messages in a per-delay TTL queue that dead-letters into the topic.
#[derive(Clone)]
pub struct AmqpBus {
  connection: Arc<Connection>,
  channel: Channel,
  declared: Arc<Mutex<HashSet<String>>>,
}

impl AmqpBus {
  pub async fn connect(rabbitmq_url: &str) -> Result<Self, BusError> {
    let conn = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
      Connection::connect(rabbitmq_url, ConnectionProperties::default())
    })
      .await?;
    let channel = conn.create_channel().await?;
    channel.confirm_select(ConfirmSelectOptions::default()).await?;
    info!("RabbitMQ channel created");
    Ok(Self {
      connection: Arc::new(conn),
      channel,
      declared: Arc::new(Mutex::new(HashSet::new())),
    })
  }

  pub async fn declare_topic(&self, topic: &str) -> Result<(), BusError> {
    self.declare(topic, FieldTable::default()).await
  }

  async fn declare(&self, queue: &str, arguments: FieldTable) -> Result<(), BusError> {
    let mut declared = self.declared.lock().await;
    if declared.contains(queue) {
      return Ok(());
    }
    let options = QueueDeclareOptions { durable: true, ..QueueDeclareOptions::default() };
    self.channel.queue_declare(queue, options, arguments).await?;
    declared.insert(queue.to_string());
    debug!("Declared queue {}", queue);
    Ok(())
  }

  async fn declare_delay_queue(&self, topic: &str, delay: Duration) -> Result<String, BusError> {
    let (queue, arguments) = delay_queue(topic, delay);
    self.declare(&queue, arguments).await?;
    Ok(queue)
  }

  async fn publish_to_queue(&self, queue: &str, payload: &[u8]) -> Result<(), BusError> {
    let properties = BasicProperties::default().with_delivery_mode(PERSISTENT);
    let channel = &self.channel;
    let confirmation = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
      let properties = properties.clone();
      async move {
        channel
          .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
          .await?
          .await
      }
    })
      .await?;
    if confirmation.is_nack() {
      return Err(BusError::NotConfirmed { topic: queue.to_string() });
    }
    Ok(())
  }

  /// Subscribes to `topic`; at most `prefetch` deliveries are unsettled at once.
  pub async fn consume(&self, topic: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream, BusError> {
    self.declare_topic(topic).await?;
    self.channel.basic_qos(prefetch, BasicQosOptions::default()).await?;
    let consumer = self.channel
      .basic_consume(topic, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
      .await?;
    info!("Consuming {} as {}", topic, consumer_tag);

    let bus = self.clone();
    let queue = topic.to_string();
    let stream = consumer.map(move |delivery| {
      delivery
        .map(|message| Box::new(AmqpDelivery { message, queue: queue.clone(), bus: bus.clone() }) as Box<dyn Delivery>)
        .map_err(BusError::from)
    });
    Ok(stream.boxed())
  }

  pub async fn close(&self) -> Result<(), BusError> {
    if self.connection.status().connected() {
      self.connection.close(200, "manager shutdown").await?;
    }
    info!("RabbitMQ connection closed");
    Ok(())
  }
}

#[async_trait]
impl MessageBus for AmqpBus {
  async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
    self.declare_topic(topic).await?;
    self.publish_to_queue(topic, payload).await
  }

  async fn deferred_publish(&self, topic: &str, delay: Duration, payload: &[u8]) -> Result<(), BusError> {
    if delay.is_zero() {
      return self.publish(topic, payload).await;
    }
    self.declare_topic(topic).await?;
    let queue = self.declare_delay_queue(topic, delay).await?;
    self.publish_to_queue(&queue, payload).await
  }
}

/// Name and arguments of the queue that parks messages for `delay` before dead-lettering
/// them into `topic`. The queue never has a consumer and is only declared once per
/// connection, so it must not carry `x-expires`.
fn delay_queue(topic: &str, delay: Duration) -> (String, FieldTable) {
  let ttl = delay.as_millis().min(u32::MAX as u128) as u32;
  let mut arguments = FieldTable::default();
  arguments.insert(ShortString::from("x-message-ttl"), AMQPValue::LongUInt(ttl));
  arguments.insert(ShortString::from("x-dead-letter-exchange"), AMQPValue::LongString(LongString::from("")));
  arguments.insert(ShortString::from("x-dead-letter-routing-key"), AMQPValue::LongString(LongString::from(topic)));
  (format!("{}.delay.{}", topic, ttl), arguments)
}

struct AmqpDelivery {
  message: AmqpMessage,
  queue: String,
  bus: AmqpBus,
}

#[async_trait]
impl Delivery for AmqpDelivery {
  fn body(&self) -> &[u8] {
    &self.message.data
  }

  async fn finish(&self) -> Result<(), BusError> {
    self.message.acker.ack(BasicAckOptions::default()).await?;
    Ok(())
  }

  async fn requeue(&self, delay: Duration) -> Result<(), BusError> {
    self.bus.deferred_publish(&self.queue, delay, &self.message.data).await?;
    self.finish().await
  }
}
