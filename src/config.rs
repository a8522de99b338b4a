use crate::error::{NotifyError, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub broker: BrokerConfig,
    pub runtime: AsyncRuntime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub bind_address: SocketAddr,
    /// Frames buffered per connection before pushes are dropped
    pub outbound_capacity: usize,
    /// Upper bound on a single socket write before the client is considered stalled
    pub send_timeout_ms: u64,
}

impl GatewayConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 5000)),
            outbound_capacity: 64,
            send_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub uri: String,
    pub queue: String,
    pub consumer_tag: String,
    pub prefetch: u16,
    pub reconnect: ReconnectPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            uri: "amqp://localhost".to_string(),
            queue: "notifications".to_string(),
            consumer_tag: format!("cravio-notify-{}", uuid::Uuid::new_v4()),
            prefetch: 1,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Exponential backoff applied when the broker link drops mid-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt: doubles each time, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsyncRuntime {
    CurrentThread,
    #[default]
    MultiThread,
}

impl FromStr for AsyncRuntime {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "current-thread" | "current_thread" => Ok(AsyncRuntime::CurrentThread),
            "multi-thread" | "multi_thread" => Ok(AsyncRuntime::MultiThread),
            other => Err(format!("unknown runtime flavour `{other}`")),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup, falling back to defaults
    /// for keys that are absent.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let port: u16 = load(&lookup, "PORT", defaults.gateway.bind_address.port())?;
        let mut bind_address = defaults.gateway.bind_address;
        bind_address.set_port(port);

        let gateway = GatewayConfig {
            bind_address,
            send_timeout_ms: load(&lookup, "NOTIFY_SEND_TIMEOUT_MS", defaults.gateway.send_timeout_ms)?,
            ..defaults.gateway
        };

        let broker = BrokerConfig {
            uri: load(&lookup, "AMQP_URL", defaults.broker.uri)?,
            queue: load(&lookup, "NOTIFY_QUEUE", defaults.broker.queue)?,
            prefetch: load(&lookup, "NOTIFY_PREFETCH", defaults.broker.prefetch)?,
            reconnect: ReconnectPolicy {
                max_attempts: load(
                    &lookup,
                    "NOTIFY_RECONNECT_ATTEMPTS",
                    defaults.broker.reconnect.max_attempts,
                )?,
                ..defaults.broker.reconnect
            },
            ..defaults.broker
        };

        let runtime = load(&lookup, "NOTIFY_RUNTIME", defaults.runtime)?;

        let config = Config { gateway, broker, runtime };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker.uri.trim().is_empty() {
            return Err(NotifyError::InvalidConfig("broker uri is empty".into()));
        }
        if self.broker.queue.trim().is_empty() {
            return Err(NotifyError::InvalidConfig("queue name is empty".into()));
        }
        if self.broker.prefetch == 0 {
            return Err(NotifyError::InvalidConfig("prefetch must be at least 1".into()));
        }
        if self.gateway.outbound_capacity == 0 {
            return Err(NotifyError::InvalidConfig("outbound_capacity must be at least 1".into()));
        }
        if self.gateway.send_timeout_ms == 0 {
            return Err(NotifyError::InvalidConfig("send_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

fn load<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + std::fmt::Debug,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| NotifyError::InvalidConfig(format!("{key}: {e}"))),
        None => {
            info!("{key} not set, using default: {default:?}");
            Ok(default)
        }
    }
}
