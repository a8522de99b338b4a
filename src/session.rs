use crate::directory::Identity;
use crate::protocol::ServerFrame;
use chrono::{DateTime, Utc};
use std::fmt;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Process-unique identifier assigned to each accepted push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Reasons why a push connection might be disconnected.
///
/// Only used for logging; every reason leads to the same cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed the socket
    PeerClosed,
    /// The transport reported a read or write error
    TransportError,
    /// A push did not complete within the send timeout
    Stalled,
    /// The server is shutting down
    Shutdown,
}

/// Why a push onto a live connection did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushFailure {
    /// The connection's writer has already gone away
    Closed,
    /// The connection's outbound buffer is full
    QueueFull,
}

/// Sending side of one live push connection.
///
/// Clones share the same outbound queue. Two handles are equal when they
/// refer to the same connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::Sender<ServerFrame>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, sender: mpsc::Sender<ServerFrame>) -> Self {
        Self { id, sender }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Queues a frame without waiting. Never blocks on the network.
    pub fn try_push(&self, frame: ServerFrame) -> Result<(), PushFailure> {
        self.sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => PushFailure::QueueFull,
            TrySendError::Closed(_) => PushFailure::Closed,
        })
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

/// Lifecycle of one push connection.
///
/// `Unregistered -> Registered -> Disconnected`. `Disconnected` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unregistered,
    Registered(Identity),
    Disconnected,
}

/// A connection accepted by the gateway, owned by its transport task.
#[derive(Debug)]
pub struct Connection {
    handle: ConnectionHandle,
    state: ConnectionState,
    connected_at: DateTime<Utc>,
}

impl Connection {
    pub(crate) fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            state: ConnectionState::Unregistered,
            connected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Identity this connection last registered. A newer connection may have
    /// taken it over since; the directory holds the live binding, see
    /// `DeliveryGateway::bound_identity`.
    pub fn identity(&self) -> Option<&Identity> {
        match &self.state {
            ConnectionState::Registered(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == ConnectionState::Disconnected
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handles_compare_by_connection_id() {
        let (tx_a, _rx_a) = mpsc::channel(1);
        let (tx_b, _rx_b) = mpsc::channel(1);
        let a = ConnectionHandle::new(ConnectionId::new(1), tx_a);
        let b = ConnectionHandle::new(ConnectionId::new(1), tx_b);
        let c = ConnectionHandle::new(ConnectionId::new(2), a.sender.clone());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn try_push_reports_full_and_closed() {
        let (tx, rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(ConnectionId::new(7), tx);
        let frame = ServerFrame::new("notification", json!({}));

        assert_eq!(handle.try_push(frame.clone()), Ok(()));
        assert_eq!(handle.try_push(frame.clone()), Err(PushFailure::QueueFull));

        drop(rx);
        assert!(handle.is_closed());
        assert_eq!(handle.try_push(frame), Err(PushFailure::Closed));
    }

    #[test]
    fn new_connection_starts_unregistered() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(ConnectionHandle::new(ConnectionId::new(3), tx));
        assert_eq!(conn.state(), &ConnectionState::Unregistered);
        assert!(conn.identity().is_none());
        assert_eq!(conn.id().to_string(), "conn-3");
    }
}
