//! JSON frames exchanged with push clients over the WebSocket transport.
//!
//! Every frame is an object with an `event` tag and a `data` body, matching
//! the event-emitter style the web and mobile clients already speak.

use crate::error::{NotifyError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event tag used when a broker message does not name one.
pub const NOTIFICATION_EVENT: &str = "notification";

/// Frames sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Bind this connection to the given identity.
    Register(String),
}

/// Frame pushed to a client. No acknowledgement is expected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub event: String,
    pub data: Value,
}

impl ServerFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self { event: event.into(), data }
    }
}

pub fn decode(text: &str) -> Result<ClientFrame> {
    serde_json::from_str(text).map_err(|e| NotifyError::Protocol(e.to_string()))
}

pub fn encode(frame: &ServerFrame) -> Result<String> {
    serde_json::to_string(frame).map_err(|e| NotifyError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_register_frame() {
        let frame = decode(r#"{"event":"register","data":"a@x.com"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Register("a@x.com".into()));
    }

    #[test]
    fn rejects_unknown_client_event() {
        assert!(matches!(
            decode(r#"{"event":"subscribe","data":"orders"}"#),
            Err(NotifyError::Protocol(_))
        ));
    }

    #[test]
    fn rejects_register_without_string_identity() {
        assert!(decode(r#"{"event":"register","data":42}"#).is_err());
        assert!(decode("not json").is_err());
    }

    #[test]
    fn encodes_event_and_data() {
        let frame = ServerFrame::new(NOTIFICATION_EVENT, json!({"orderId": "O1"}));
        let text = encode(&frame).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"event": "notification", "data": {"orderId": "O1"}}));
    }
}
