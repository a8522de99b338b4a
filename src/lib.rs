#![doc = include_str!("../README.md")]
#![warn(rustdoc::broken_intra_doc_links)]
pub mod broker;
pub mod config;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod transport;

pub use broker::{run_consumer, BrokerClient, BrokerLink};
pub use config::{BrokerConfig, Config, GatewayConfig, ReconnectPolicy};
pub use directory::{Identity, SessionDirectory};
pub use error::{NotifyError, Result};
pub use gateway::{DeliveryGateway, DeliveryOutcome};
pub use pipeline::{Acknowledge, Dispatch, Disposition, InboundDelivery, IngestionPipeline, NotificationMessage};
pub use session::{Connection, ConnectionHandle, ConnectionId, ConnectionState, DisconnectReason, PushFailure};
