use crate::config::GatewayConfig;
use crate::directory::{Identity, SessionDirectory};
use crate::error::Result;
use crate::pipeline::{Dispatch, NotificationMessage};
use crate::protocol::ServerFrame;
use crate::session::{
    Connection, ConnectionHandle, ConnectionId, ConnectionState, DisconnectReason, PushFailure,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Result of one attempt to push an event to an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Queued on the identity's live connection
    Delivered,
    /// No live connection for the identity; an expected outcome
    NotConnected,
    /// A live connection exists but the push could not be queued
    Dropped(PushFailure),
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered => "delivered",
            DeliveryOutcome::NotConnected => "not_connected",
            DeliveryOutcome::Dropped(PushFailure::Closed) => "dropped_closed",
            DeliveryOutcome::Dropped(PushFailure::QueueFull) => "dropped_queue_full",
        }
    }
}

/// Owns live push connections and the only writers of the session directory.
///
/// Built once at startup and shared by `Arc` between the transport and the
/// ingestion pipeline.
#[derive(Debug)]
pub struct DeliveryGateway {
    directory: SessionDirectory,
    next_connection_id: AtomicU64,
    outbound_capacity: usize,
    send_timeout: Duration,
}

impl DeliveryGateway {
    pub fn new(config: &GatewayConfig) -> Arc<Self> {
        Arc::new(Self {
            directory: SessionDirectory::new(),
            next_connection_id: AtomicU64::new(0),
            outbound_capacity: config.outbound_capacity.max(1),
            send_timeout: config.send_timeout(),
        })
    }

    /// Accepts a new transport connection in the unregistered state.
    ///
    /// The returned receiver yields every frame pushed to this connection; the
    /// transport drains it onto the socket.
    pub fn accept(&self) -> (Connection, mpsc::Receiver<ServerFrame>) {
        let id = ConnectionId::new(self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::channel(self.outbound_capacity);
        debug!(connection_id = %id, "connection accepted");
        (Connection::new(ConnectionHandle::new(id, tx)), rx)
    }

    /// Binds `connection` to `identity`. A connection that already carries a
    /// different identity is unbound from it first.
    pub fn on_register(&self, connection: &mut Connection, identity: Identity) {
        if connection.is_disconnected() {
            debug!(connection_id = %connection.id(), %identity, "register on closed connection ignored");
            return;
        }

        let registration = self.directory.register(identity.clone(), connection.handle().clone());
        if let Some(evicted) = registration.evicted {
            info!(%identity, connection_id = %connection.id(), evicted = %evicted, "identity moved to new connection");
        }
        if let Some(previous) = registration.previous_identity {
            info!(%identity, %previous, connection_id = %connection.id(), "connection re-registered under new identity");
        }
        info!(%identity, connection_id = %connection.id(), "user registered");
        connection.set_state(ConnectionState::Registered(identity));
    }

    /// Removes the connection's binding. Safe to call more than once.
    pub fn on_disconnect(&self, connection: &mut Connection, reason: DisconnectReason) {
        if connection.is_disconnected() {
            return;
        }
        let identity = self.directory.unregister(connection.id());
        if identity.is_none() {
            if let Some(superseded) = connection.identity() {
                debug!(connection_id = %connection.id(), identity = %superseded, "identity already held by a newer connection");
            }
        }
        connection.set_state(ConnectionState::Disconnected);
        info!(
            connection_id = %connection.id(),
            identity = identity.as_ref().map(Identity::as_str),
            ?reason,
            "client disconnected"
        );
    }

    /// The identity the directory currently routes to `connection`, if any.
    /// Unlike `Connection::identity` this reflects takeovers by newer
    /// connections.
    pub fn bound_identity(&self, connection: &Connection) -> Option<Identity> {
        self.directory.identity_of(connection.id())
    }

    /// Pushes `(event, payload)` to the connection registered for `identity`.
    ///
    /// Lookup and enqueue happen under the directory lock; the socket write
    /// itself happens later on the connection's writer, so this never waits
    /// on a slow client.
    pub fn emit_to_identity(&self, identity: &str, event: &str, payload: Value) -> DeliveryOutcome {
        let frame = ServerFrame::new(event, payload);
        let outcome = match self.directory.with_handle(identity, |handle| (handle.id(), handle.try_push(frame))) {
            None => DeliveryOutcome::NotConnected,
            Some((_, Ok(()))) => DeliveryOutcome::Delivered,
            Some((id, Err(failure))) => {
                warn!(identity, connection_id = %id, ?failure, event, "push dropped");
                DeliveryOutcome::Dropped(failure)
            }
        };
        match outcome {
            DeliveryOutcome::Delivered => debug!(identity, event, "event emitted"),
            DeliveryOutcome::NotConnected => info!(identity, event, "user not connected"),
            DeliveryOutcome::Dropped(_) => {}
        }
        outcome
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    pub fn connected_identities(&self) -> usize {
        self.directory.len()
    }
}

#[async_trait]
impl Dispatch for DeliveryGateway {
    async fn dispatch(&self, message: NotificationMessage) -> Result<DeliveryOutcome> {
        Ok(self.emit_to_identity(message.identity.as_str(), &message.event, message.payload))
    }
}
