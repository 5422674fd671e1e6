//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`,
//! so partial JSON is accepted and missing fields get their production
//! default during deserialization.

mod signal;

pub use signal::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// Loaded from `~/.beacon/settings.json` with defaults applied for missing
/// fields. Environment variables can override specific values.
///
/// ```json
/// {
///   "discovery": { "timeoutMs": 2000 },
///   "transport": { "maxPayloadBytes": 131072 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BeaconSettings {
    /// Settings schema version.
    pub version: String,
    /// Discovery (name resolution) settings.
    pub discovery: DiscoverySettings,
    /// Transport payload limits.
    pub transport: TransportSettings,
    /// Network method call settings.
    pub network: NetworkSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Default for BeaconSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            discovery: DiscoverySettings::default(),
            transport: TransportSettings::default(),
            network: NetworkSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let settings = BeaconSettings::default();
        let value = serde_json::to_value(&settings).unwrap();
        assert_eq!(value["discovery"]["timeoutMs"], 5000);
        assert_eq!(value["transport"]["maxPayloadBytes"], 65_536);
        assert_eq!(value["transport"]["maxArgs"], 64);
        assert_eq!(value["network"]["callTimeoutMs"], 10_000);
        assert_eq!(value["logging"]["level"], "warn");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: BeaconSettings =
            serde_json::from_str(r#"{"transport": {"maxArgs": 8}}"#).unwrap();
        assert_eq!(settings.transport.max_args, 8);
        assert_eq!(settings.transport.max_payload_bytes, 65_536);
        assert_eq!(settings.discovery.timeout_ms, 5000);
    }
}
