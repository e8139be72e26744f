//! Events pushed to subscribers of the control plane.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::ServerStatus;

/// Capacity of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Live traffic for one client, as derived from a status dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTraffic {
    /// Received volume, e.g. `1.39 MiB received`; `0 B` without data.
    pub received: String,
    /// Sent volume; `0 B` without data.
    pub sent: String,
    /// Remote `address:port`.
    pub endpoint: Option<String>,
    /// Geographic label for the endpoint.
    pub geo: Option<String>,
    /// Country code for the endpoint.
    pub geo_country_code: Option<String>,
    /// Handshake text as reported.
    pub latest_handshake: Option<String>,
    /// Handshake age in seconds.
    pub latest_handshake_seconds: Option<u64>,
    /// Whether the client counts as active.
    pub active: bool,
}

impl Default for ClientTraffic {
    fn default() -> Self {
        Self {
            received: "0 B".to_string(),
            sent: "0 B".to_string(),
            endpoint: None,
            geo: None,
            geo_country_code: None,
            latest_handshake: None,
            latest_handshake_seconds: None,
            active: false,
        }
    }
}

/// Traffic for every client of one server, keyed by client id.
pub type ServerTraffic = BTreeMap<String, ClientTraffic>;

/// A state change published on the event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ControlEvent {
    /// A server was started or stopped.
    ServerStatus {
        /// Server id.
        server_id: String,
        /// New status.
        status: ServerStatus,
    },

    /// Fresh traffic figures for a running server.
    TrafficUpdate {
        /// Server id.
        server_id: String,
        /// Per-client traffic.
        traffic: ServerTraffic,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = ControlEvent::ServerStatus {
            server_id: "a1b2c3".to_string(),
            status: ServerStatus::Running,
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "server_status");
        assert_eq!(json["data"]["server_id"], "a1b2c3");
        assert_eq!(json["data"]["status"], "running");
    }

    #[test]
    fn test_traffic_defaults() {
        let traffic = ClientTraffic::default();
        assert_eq!(traffic.received, "0 B");
        assert_eq!(traffic.sent, "0 B");
        assert!(!traffic.active);
    }
}
