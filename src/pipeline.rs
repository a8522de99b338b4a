//! Broker message ingestion: parse, route to the gateway, acknowledge.
//!
//! Messages are processed strictly one at a time in delivery order. The
//! acknowledgement decision for each message is:
//!
//! | Result of processing                 | Acknowledgement          |
//! |--------------------------------------|--------------------------|
//! | dispatched (delivered or not)        | `ack`                    |
//! | body is not a JSON object / no email | `nack`, never requeued   |
//! | dispatch error or panic              | `nack`, requeued once    |
//!
//! A message that fails unexpectedly on redelivery is dropped instead of
//! requeued so it cannot cycle through the queue forever.

use crate::directory::Identity;
use crate::error::{NotifyError, Result};
use crate::gateway::DeliveryOutcome;
use crate::protocol::NOTIFICATION_EVENT;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, Stream, StreamExt};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

const ROUTING_FIELD: &str = "email";
const EVENT_FIELD: &str = "event";

/// A parsed notification ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationMessage {
    pub identity: Identity,
    pub event: String,
    /// The complete decoded message body
    pub payload: Value,
}

impl NotificationMessage {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| NotifyError::MalformedMessage(format!("invalid JSON: {e}")))?;

        let object = payload
            .as_object()
            .ok_or_else(|| NotifyError::MalformedMessage("body is not a JSON object".into()))?;

        let identity = object
            .get(ROUTING_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| NotifyError::MalformedMessage(format!("missing `{ROUTING_FIELD}`")))
            .and_then(|raw| {
                Identity::new(raw)
                    .map_err(|_| NotifyError::MalformedMessage(format!("empty `{ROUTING_FIELD}`")))
            })?;

        let event = object
            .get(EVENT_FIELD)
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
            .unwrap_or(NOTIFICATION_EVENT)
            .to_string();

        Ok(Self { identity, event, payload })
    }
}

/// Destination for parsed notifications.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, message: NotificationMessage) -> Result<DeliveryOutcome>;
}

/// Settles one broker delivery.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;
    /// Negative acknowledgement; `requeue` asks the broker to redeliver.
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// One message pulled from the broker, with the means to settle it.
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub body: Bytes,
    acker: Box<dyn Acknowledge>,
}

impl InboundDelivery {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        body: impl Into<Bytes>,
        acker: impl Acknowledge + 'static,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            body: body.into(),
            acker: Box::new(acker),
        }
    }
}

impl std::fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Rejected,
    Requeued,
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    acked: AtomicU64,
    rejected: AtomicU64,
    requeued: AtomicU64,
    delivered: AtomicU64,
    not_connected: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub acked: u64,
    pub rejected: u64,
    pub requeued: u64,
    pub delivered: u64,
    pub not_connected: u64,
    pub dropped: u64,
}

impl PipelineStats {
    fn record_outcome(&self, outcome: DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Delivered => &self.delivered,
            DeliveryOutcome::NotConnected => &self.not_connected,
            DeliveryOutcome::Dropped(_) => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_disposition(&self, disposition: Disposition) {
        let counter = match disposition {
            Disposition::Acked => &self.acked,
            Disposition::Rejected => &self.rejected,
            Disposition::Requeued => &self.requeued,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            acked: self.acked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            not_connected: self.not_connected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

pub struct IngestionPipeline {
    dispatcher: Arc<dyn Dispatch>,
    stats: PipelineStats,
}

impl IngestionPipeline {
    pub fn new(dispatcher: Arc<dyn Dispatch>) -> Self {
        Self {
            dispatcher,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    async fn handle(&self, body: &[u8]) -> Result<DeliveryOutcome> {
        let message = NotificationMessage::parse(body)?;
        debug!(identity = %message.identity, event = %message.event, "received message");
        self.dispatcher.dispatch(message).await
    }

    /// Processes and settles a single delivery. Never fails: every error is
    /// turned into a negative acknowledgement and logged.
    pub async fn process(&self, delivery: InboundDelivery) -> Disposition {
        let tag = delivery.delivery_tag;
        let result = AssertUnwindSafe(self.handle(&delivery.body)).catch_unwind().await;

        let disposition = match result {
            Ok(Ok(outcome)) => {
                self.stats.record_outcome(outcome);
                debug!(delivery_tag = tag, outcome = outcome.as_str(), "message dispatched");
                Disposition::Acked
            }
            Ok(Err(e)) if e.is_malformed() => {
                error!(delivery_tag = tag, error = %e, "rejecting malformed message");
                Disposition::Rejected
            }
            Ok(Err(e)) => {
                error!(delivery_tag = tag, error = %e, redelivered = delivery.redelivered, "error processing message");
                unexpected_failure(delivery.redelivered)
            }
            Err(_) => {
                error!(delivery_tag = tag, redelivered = delivery.redelivered, "panic while processing message");
                unexpected_failure(delivery.redelivered)
            }
        };

        let settled = match disposition {
            Disposition::Acked => delivery.acker.ack().await,
            Disposition::Rejected => delivery.acker.nack(false).await,
            Disposition::Requeued => delivery.acker.nack(true).await,
        };
        if let Err(e) = settled {
            warn!(delivery_tag = tag, error = %e, ?disposition, "failed to settle delivery");
        }

        self.stats.record_disposition(disposition);
        disposition
    }

    /// Pulls deliveries until the stream ends (`Ok`) or reports an error
    /// (`Err`, the broker link is gone). Per-message failures never end the
    /// loop.
    pub async fn run<S>(&self, mut deliveries: S) -> Result<()>
    where
        S: Stream<Item = Result<InboundDelivery>> + Unpin + Send,
    {
        while let Some(next) = deliveries.next().await {
            self.process(next?).await;
        }
        Ok(())
    }
}

fn unexpected_failure(redelivered: bool) -> Disposition {
    if redelivered {
        Disposition::Rejected
    } else {
        Disposition::Requeued
    }
}
