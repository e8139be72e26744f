//! Persisted entity records.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use awg_wireguard::{ObfuscationParams, PresharedKey, PrivateKey, PublicKey};
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// Schema version written by this release.
pub const SCHEMA_VERSION: u32 = 2;

/// Lifecycle state of a server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Interface down.
    #[default]
    Stopped,
    /// Interface up.
    Running,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Derived activity of a client; never set by users.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    /// Handshake within the activity window.
    Active,
    /// No recent handshake.
    #[default]
    Inactive,
}

impl ClientStatus {
    /// Status for an activity flag.
    #[must_use]
    pub const fn from_active(active: bool) -> Self {
        if active { Self::Active } else { Self::Inactive }
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

fn default_protocol() -> String {
    "wireguard".to_string()
}

const fn default_true() -> bool {
    true
}

/// Servers written before MTU was recorded ran at 1420.
const fn legacy_mtu() -> u16 {
    1420
}

/// A tunnel endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Short random identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Protocol tag.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// UDP listen port.
    pub port: u16,
    /// Last observed lifecycle state.
    #[serde(default)]
    pub status: ServerStatus,
    /// Interface name, `wg-<id>`.
    pub interface: String,
    /// Configuration file owned by this server.
    pub config_path: PathBuf,
    /// Server public key.
    pub server_public_key: PublicKey,
    /// Server private key.
    pub server_private_key: PrivateKey,
    /// Tunnel subnet.
    pub subnet: Ipv4Net,
    /// Server tunnel address, host 1 of the subnet.
    pub server_ip: Ipv4Addr,
    /// Interface MTU.
    #[serde(default = "legacy_mtu")]
    pub mtu: u16,
    /// Endpoint host clients dial.
    pub public_ip: String,
    /// Whether obfuscation is on.
    #[serde(default)]
    pub obfuscation_enabled: bool,
    /// Obfuscation parameters; `I1`..`I5` are defaults for new clients.
    #[serde(default, deserialize_with = "legacy::obfuscation_params")]
    pub obfuscation_params: Option<ObfuscationParams>,
    /// Start on daemon startup.
    #[serde(default = "default_true")]
    pub auto_start: bool,
    /// Masquerade tunnel traffic.
    #[serde(default = "default_true")]
    pub enable_nat: bool,
    /// Block LAN ranges for clients.
    #[serde(default = "default_true")]
    pub block_lan_cidrs: bool,
    /// DNS servers pushed to clients.
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
    /// Mirror of this server's clients, in creation order.
    #[serde(default)]
    pub clients: Vec<Client>,
    /// Creation time.
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Server {
    /// Interface name for a server id.
    #[must_use]
    pub fn interface_name(id: &str) -> String {
        format!("wg-{id}")
    }

    /// Embedded mirror entry for a client id.
    #[must_use]
    pub fn client(&self, client_id: &str) -> Option<&Client> {
        self.clients.iter().find(|c| c.id == client_id)
    }

    /// Whether a client with this display name exists on the server.
    #[must_use]
    pub fn has_client_named(&self, name: &str) -> bool {
        self.clients.iter().any(|c| c.name == name)
    }
}

/// A peer authorized on one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    /// Short random identifier.
    pub id: String,
    /// Display name; also the config file marker.
    pub name: String,
    /// Owning server.
    pub server_id: String,
    /// Owning server's display name at creation time.
    #[serde(default)]
    pub server_name: String,
    /// Derived activity.
    #[serde(default)]
    pub status: ClientStatus,
    /// Creation time.
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    /// Client private key.
    pub client_private_key: PrivateKey,
    /// Client public key; matched against the status dump.
    pub client_public_key: PublicKey,
    /// Preshared key.
    #[serde(deserialize_with = "legacy::preshared_key")]
    pub preshared_key: PresharedKey,
    /// Tunnel address.
    pub client_ip: Ipv4Addr,
    /// Whether obfuscation is on for this client.
    #[serde(default)]
    pub obfuscation_enabled: bool,
    /// This client's own copy of the obfuscation parameters.
    #[serde(default, deserialize_with = "legacy::obfuscation_params")]
    pub obfuscation_params: Option<ObfuscationParams>,
}

/// The whole persisted state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Absent in documents written before versioning; read as 0.
    #[serde(default)]
    pub schema_version: u32,
    /// Servers in creation order.
    #[serde(default)]
    pub servers: Vec<Server>,
    /// Every client by id.
    #[serde(default)]
    pub clients: BTreeMap<String, Client>,
}

impl Document {
    /// An empty document at the current schema version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            ..Self::default()
        }
    }
}

/// Timestamps are written as RFC 3339 and read from either RFC 3339 or
/// float epoch seconds.
pub(crate) mod timestamp {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Epoch(f64),
        Text(String),
    }

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Epoch(secs) => {
                let whole = secs.trunc() as i64;
                let nanos = ((secs - secs.trunc()) * 1e9) as u32;
                Utc.timestamp_opt(whole, nanos)
                    .single()
                    .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {secs}")))
            }
            Raw::Text(text) => DateTime::parse_from_rfc3339(&text)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Shapes written before the schema was versioned.
mod legacy {
    use awg_wireguard::{ObfuscationParams, PresharedKey};
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;
    use tracing::debug;

    /// A null key was stored when `genpsk` failed; a fresh random key
    /// takes its place.
    pub fn preshared_key<'de, D>(deserializer: D) -> Result<PresharedKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<PresharedKey>::deserialize(deserializer)?.unwrap_or_else(|| {
            debug!("replacing missing preshared key");
            PresharedKey::random()
        }))
    }

    /// An object holding only `I1`..`I5` means no parameter set was ever
    /// generated, so it reads as none.
    pub fn obfuscation_params<'de, D>(
        deserializer: D,
    ) -> Result<Option<ObfuscationParams>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(value) = Option::<Value>::deserialize(deserializer)? else {
            return Ok(None);
        };
        if value.get("Jc").is_none() {
            debug!("dropping obfuscation object without numeric parameters");
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use awg_wireguard::KEY_SIZE;

    fn legacy_server_json() -> serde_json::Value {
        serde_json::json!({
            "id": "a1b2c3",
            "name": "Main",
            "protocol": "wireguard",
            "port": 51820,
            "status": "running",
            "interface": "wg-a1b2c3",
            "config_path": "/etc/amnezia/amneziawg/wg-a1b2c3.conf",
            "server_public_key": PublicKey::from_bytes_array([1; KEY_SIZE]).to_base64(),
            "server_private_key": PrivateKey::from_bytes_array([2; KEY_SIZE]).to_base64(),
            "subnet": "10.0.0.0/24",
            "server_ip": "10.0.0.1",
            "public_ip": "203.0.113.7",
            "obfuscation_enabled": false,
            "obfuscation_params": null,
            "dns": ["8.8.8.8"],
            "clients": [],
            "created_at": 1_718_000_000.25
        })
    }

    #[test]
    fn legacy_server_fills_defaults() {
        let server: Server = serde_json::from_value(legacy_server_json()).expect("parse");
        assert_eq!(server.mtu, 1420);
        assert!(server.auto_start);
        assert!(server.enable_nat);
        assert!(server.block_lan_cidrs);
        assert_eq!(server.status, ServerStatus::Running);
        assert_eq!(server.created_at.timestamp(), 1_718_000_000);
        assert_eq!(server.created_at.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn timestamps_written_as_rfc3339() {
        let server: Server = serde_json::from_value(legacy_server_json()).expect("parse");
        let json = serde_json::to_value(&server).expect("serialize");
        let text = json["created_at"].as_str().expect("string timestamp");
        assert!(text.starts_with("2024-06-10T"));

        let back: Server = serde_json::from_value(json).expect("reparse");
        assert_eq!(back, server);
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(
            serde_json::to_string(&ServerStatus::Running).expect("serialize"),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&ClientStatus::Inactive).expect("serialize"),
            "\"inactive\""
        );
        assert_eq!(ClientStatus::from_active(true), ClientStatus::Active);
    }

    #[test]
    fn empty_legacy_document() {
        let doc: Document =
            serde_json::from_str(r#"{"servers": [], "clients": {}}"#).expect("parse");
        assert_eq!(doc.schema_version, 0);
        assert_eq!(Document::new().schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn interface_name_derivation() {
        assert_eq!(Server::interface_name("a1b2c3"), "wg-a1b2c3");
    }
}
