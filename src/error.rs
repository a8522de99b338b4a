use thiserror::Error;

/// Error types that can occur in the notification service.
///
/// Per-message failures (`MalformedMessage`, `Processing`) are handled inside
/// the ingestion loop and never stop it. Startup failures (`Broker`,
/// `InvalidConfig`, `Io`) and an exhausted reconnect budget
/// (`BrokerUnavailable`) are fatal to the process.
#[derive(Error, Debug)]
pub enum NotifyError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration validation failed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The AMQP connection or channel reported an error
    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),

    /// Reconnecting to the broker failed on every attempt
    #[error("Broker unavailable after {attempts} reconnect attempts")]
    BrokerUnavailable { attempts: u32 },

    /// A broker message could not be parsed or has no routing identity
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A client frame could not be encoded or decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Dispatching a well-formed message failed
    #[error("Processing error: {0}")]
    Processing(String),
}

impl NotifyError {
    /// Whether redelivering the message could never succeed.
    pub fn is_malformed(&self) -> bool {
        matches!(self, NotifyError::MalformedMessage(_))
    }
}

pub type Result<T> = std::result::Result<T, NotifyError>;
