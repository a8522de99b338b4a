use crate::config::{BrokerConfig, ReconnectPolicy};
use crate::error::{NotifyError, Result};
use crate::pipeline::{Acknowledge, InboundDelivery, IngestionPipeline};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use tracing::{error, info, warn};

/// Settles a delivery on the AMQP channel it arrived on.
struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }
}

fn into_inbound(delivery: Delivery) -> InboundDelivery {
    InboundDelivery::new(
        delivery.delivery_tag,
        delivery.redelivered,
        delivery.data,
        AmqpAcker(delivery.acker),
    )
}

/// One broker session that can be consumed from and reopened.
///
/// `run_consumer` drives any link through the reconnect loop; the AMQP
/// implementation is [`BrokerClient`].
#[async_trait]
pub trait BrokerLink: Send {
    /// Starts a manual-ack consumer on the current channel.
    async fn consume(&mut self) -> Result<BoxStream<'static, Result<InboundDelivery>>>;
    /// Replaces the current connection and channel with fresh ones.
    async fn reopen(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;
}

/// Single-owner link to the message broker: one connection, one channel,
/// one consumer on one durable queue.
pub struct BrokerClient {
    config: BrokerConfig,
    connection: Connection,
    channel: Channel,
}

impl BrokerClient {
    /// Connects, sets prefetch and declares the durable queue. Any failure
    /// here is fatal to startup.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let (connection, channel) = Self::open(config).await?;
        info!(queue = %config.queue, "broker connected and channel created");
        Ok(Self {
            config: config.clone(),
            connection,
            channel,
        })
    }

    async fn open(config: &BrokerConfig) -> Result<(Connection, Channel)> {
        let connection = Connection::connect(&config.uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await?;
        channel
            .queue_declare(
                &config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok((connection, channel))
    }

    /// Feeds the queue into `pipeline` until the broker becomes unreachable.
    pub async fn run(mut self, pipeline: IngestionPipeline) -> Result<()> {
        let policy = self.config.reconnect.clone();
        run_consumer(&mut self, &policy, &pipeline).await
    }
}

#[async_trait]
impl BrokerLink for BrokerClient {
    async fn consume(&mut self) -> Result<BoxStream<'static, Result<InboundDelivery>>> {
        let consumer = self
            .channel
            .basic_consume(
                &self.config.queue,
                &self.config.consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        info!(queue = %self.config.queue, "consuming");
        Ok(consumer
            .map(|next| next.map(into_inbound).map_err(NotifyError::from))
            .boxed())
    }

    async fn reopen(&mut self) -> Result<()> {
        let (connection, channel) = Self::open(&self.config).await?;
        self.connection = connection;
        self.channel = channel;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

/// Consumes from `link` into `pipeline`, reopening the link whenever the
/// consumer stream ends or fails.
///
/// Each outage gets a fresh budget of `policy.max_attempts` reopen attempts
/// with exponential backoff; once a budget is spent this returns
/// `BrokerUnavailable`.
pub async fn run_consumer<L>(link: &mut L, policy: &ReconnectPolicy, pipeline: &IngestionPipeline) -> Result<()>
where
    L: BrokerLink + ?Sized,
{
    loop {
        match link.consume().await {
            Ok(deliveries) => {
                let result = pipeline.run(deliveries).await;
                let connected = link.is_connected();
                match result {
                    Ok(()) => warn!(connected, "consumer stream ended"),
                    Err(e) => warn!(connected, error = %e, "consumer stream failed"),
                }
            }
            Err(e) => warn!(error = %e, "failed to start consumer"),
        }
        reconnect(link, policy).await?;
    }
}

async fn reconnect<L>(link: &mut L, policy: &ReconnectPolicy) -> Result<()>
where
    L: BrokerLink + ?Sized,
{
    for attempt in 1..=policy.max_attempts {
        let delay = policy.backoff(attempt);
        warn!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting to broker");
        tokio::time::sleep(delay).await;
        match link.reopen().await {
            Ok(()) => {
                info!(attempt, "broker reconnected");
                return Ok(());
            }
            Err(e) => warn!(attempt, error = %e, "broker reconnect failed"),
        }
    }
    error!(attempts = policy.max_attempts, "giving up on broker");
    Err(NotifyError::BrokerUnavailable {
        attempts: policy.max_attempts,
    })
}
