//! Parsing of `awg show <interface>` output.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WireGuardError};

/// A peer whose last handshake is at most this old counts as active.
pub const ACTIVE_HANDSHAKE_WINDOW_SECS: u64 = 300;

/// Raw per-peer values from one status dump.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStats {
    /// Remote `address:port`, if the peer has connected.
    pub endpoint: Option<String>,
    /// Relative handshake text, e.g. `1 minute, 2 seconds ago`.
    pub latest_handshake: Option<String>,
    /// Human-readable received volume, e.g. `1.39 MiB`.
    pub received: Option<String>,
    /// Human-readable sent volume.
    pub sent: Option<String>,
}

impl PeerStats {
    /// Elapsed seconds since the last handshake, if one happened.
    #[must_use]
    pub fn handshake_seconds(&self) -> Option<u64> {
        self.latest_handshake
            .as_deref()
            .and_then(parse_handshake_seconds)
    }

    /// Whether the peer handshook within the activity window.
    #[must_use]
    pub fn is_active(&self) -> bool {
        is_active(self.handshake_seconds())
    }
}

/// Parses a status dump into per-peer stats keyed by base64 public key.
///
/// Each `transfer:` line closes the current peer's record. Empty output
/// yields an empty map.
///
/// # Errors
///
/// Returns [`WireGuardError::StatusParse`] if non-empty output does not
/// look like a status dump.
pub fn parse_show(interface: &str, output: &str) -> Result<HashMap<String, PeerStats>> {
    let mut peers: HashMap<String, PeerStats> = HashMap::new();
    if output.trim().is_empty() {
        return Ok(peers);
    }
    if !output.lines().any(|l| l.trim_start().starts_with("interface:")) {
        return Err(WireGuardError::StatusParse {
            interface: interface.to_string(),
            message: "missing interface line".to_string(),
        });
    }

    let mut current: Option<String> = None;
    for line in output.lines().map(str::trim) {
        if let Some(key) = line.strip_prefix("peer:") {
            let key = key.trim();
            current = (!key.is_empty()).then(|| key.to_string());
            if let Some(key) = &current {
                peers.entry(key.clone()).or_default();
            }
            continue;
        }
        let Some(key) = &current else {
            continue;
        };
        let entry = peers.entry(key.clone()).or_default();

        if let Some(value) = line.strip_prefix("endpoint:") {
            entry.endpoint = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("latest handshake:") {
            entry.latest_handshake = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("transfer:") {
            let mut parts = value.trim().split(',');
            entry.received = parts.next().map(|p| p.trim().to_string());
            entry.sent = parts.next().map(|p| p.trim().to_string());
            current = None;
        }
    }
    Ok(peers)
}

static HANDSHAKE_UNIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)\s+(second|minute|hour|day)s?").unwrap_or_else(|_| unreachable!())
});

/// Converts relative handshake text to elapsed seconds.
///
/// `never` (any case) and text that sums to zero give `None`; `just now`
/// gives `Some(0)`.
#[must_use]
pub fn parse_handshake_seconds(text: &str) -> Option<u64> {
    let s = text.trim().to_lowercase();
    if s.is_empty() || s.contains("never") {
        return None;
    }
    if s.contains("just now") {
        return Some(0);
    }

    let total: u64 = HANDSHAKE_UNIT
        .captures_iter(&s)
        .filter_map(|caps| {
            let n: u64 = caps[1].parse().ok()?;
            let unit = match &caps[2] {
                "second" => 1,
                "minute" => 60,
                "hour" => 3_600,
                _ => 86_400,
            };
            Some(n.saturating_mul(unit))
        })
        .fold(0, u64::saturating_add);

    (total > 0).then_some(total)
}

/// Activity rule: a handshake was seen and is at most five minutes old.
#[must_use]
pub fn is_active(handshake_seconds: Option<u64>) -> bool {
    handshake_seconds.is_some_and(|s| s <= ACTIVE_HANDSHAKE_WINDOW_SECS)
}

/// Extracts the IP from an `ip:port` or `[ipv6]:port` endpoint.
#[must_use]
pub fn endpoint_ip(endpoint: &str) -> Option<IpAddr> {
    endpoint.parse::<SocketAddr>().ok().map(|addr| addr.ip())
}
