//! Discovery, transport, network, and logging settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name resolution settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoverySettings {
    /// How long `from_parent` waits for a name to be published.
    pub timeout_ms: u64,
}

impl DiscoverySettings {
    /// Discovery timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

/// Limits the transport enforces on each packet.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    /// Maximum encoded size of one packet in bytes.
    pub max_payload_bytes: usize,
    /// Maximum number of arguments in one tuple.
    pub max_args: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_payload_bytes: 65_536,
            max_args: 64,
        }
    }
}

/// Network method call settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkSettings {
    /// How long `invoke` waits for a reply.
    pub call_timeout_ms: u64,
}

impl NetworkSettings {
    /// Call timeout as a [`Duration`].
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: 10_000,
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable compact lines.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`trace`, `debug`, `info`, `warn`, `error`) or an
    /// `EnvFilter` directive string.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl LoggingSettings {
    /// Install the global tracing subscriber described by these settings.
    pub fn init(&self) {
        match self.format {
            LogFormat::Compact => beacon_core::logging::init_subscriber(&self.level),
            LogFormat::Json => beacon_core::logging::init_json_subscriber(&self.level),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Compact,
        }
    }
}
