//! Control-plane settings.
//!
//! Settings come from an optional TOML file and are then overridden by the
//! deployment's environment variables:
//!
//! | Variable | Field |
//! |---|---|
//! | `AUTO_START_SERVERS` | `auto_start_servers`, `defaults.auto_start` |
//! | `DEFAULT_MTU` | `defaults.mtu` |
//! | `DEFAULT_SUBNET` | `defaults.subnet` |
//! | `DEFAULT_PORT` | `defaults.port` |
//! | `DEFAULT_DNS` | `defaults.dns` (comma separated) |
//! | `ENABLE_NAT` | `defaults.enable_nat` |
//! | `BLOCK_LAN_CIDRS` | `defaults.block_lan_cidrs` |
//! | `ENABLE_GEOIP` | `enable_geoip` |
//! | `PUBLIC_IP` | `public_ip` |

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use awg_wireguard::{ToolPaths, check_mtu};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};

/// Endpoint host written into client configs until a real one is set.
pub const PUBLIC_IP_PLACEHOLDER: &str = "YOUR_SERVER_IP";

/// Parses a boolean leniently: `0`, `false`, `no` and `off` are false,
/// empty, `none` and `null` keep `default`, anything else is true.
#[must_use]
pub fn parse_bool(value: &str, default: bool) -> bool {
    let v = value.trim().to_ascii_lowercase();
    match v.as_str() {
        "" | "none" | "null" => default,
        "0" | "false" | "no" | "off" => false,
        _ => true,
    }
}

/// Parses a comma-separated list of IPv4 literals, skipping empty entries.
///
/// # Errors
///
/// Returns a validation error naming the first invalid entry.
pub fn parse_dns_list(value: &str) -> Result<Vec<Ipv4Addr>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Ipv4Addr>()
                .map_err(|_| ControlError::validation(format!("invalid DNS server IP: {s}")))
        })
        .collect()
}

/// Defaults applied to newly created servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerDefaults {
    /// Tunnel MTU.
    pub mtu: u16,
    /// Tunnel subnet.
    pub subnet: Ipv4Net,
    /// UDP listen port.
    pub port: u16,
    /// DNS servers pushed to clients.
    pub dns: Vec<Ipv4Addr>,
    /// Masquerade tunnel traffic.
    pub enable_nat: bool,
    /// Block clients from reaching private LAN ranges.
    pub block_lan_cidrs: bool,
    /// Generate obfuscation parameters.
    pub obfuscation: bool,
    /// Start new servers immediately and on daemon startup.
    pub auto_start: bool,
}

impl Default for ServerDefaults {
    fn default() -> Self {
        Self {
            mtu: 1280,
            subnet: Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 24).unwrap_or_else(|_| unreachable!()),
            port: 51820,
            dns: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)],
            enable_nat: true,
            block_lan_cidrs: true,
            obfuscation: true,
            auto_start: true,
        }
    }
}

/// Firewall script locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallScripts {
    /// Rule setup script.
    pub setup: PathBuf,
    /// Rule cleanup script.
    pub cleanup: PathBuf,
}

impl Default for FirewallScripts {
    fn default() -> Self {
        Self {
            setup: PathBuf::from("/app/scripts/setup_iptables.sh"),
            cleanup: PathBuf::from("/app/scripts/cleanup_iptables.sh"),
        }
    }
}

/// All control-plane settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root configuration directory.
    pub config_dir: PathBuf,
    /// Directory holding one `<interface>.conf` per server.
    pub tunnel_dir: PathBuf,
    /// Persisted state document.
    pub state_file: PathBuf,
    /// Defaults for new servers.
    pub defaults: ServerDefaults,
    /// Start servers flagged `auto_start` when the daemon starts.
    pub auto_start_servers: bool,
    /// Enrich peer endpoints with a geographic label.
    pub enable_geoip: bool,
    /// Endpoint host written into client configs.
    pub public_ip: String,
    /// Traffic reconciliation interval.
    pub poll_interval_secs: u64,
    /// Minimum spacing of status-driven document writes.
    pub status_persist_interval_secs: u64,
    /// Timeout for every external command.
    pub command_timeout_secs: u64,
    /// Tunnel tool locations.
    pub tools: ToolPaths,
    /// Firewall script locations.
    pub firewall: FirewallScripts,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/etc/amnezia"),
            tunnel_dir: PathBuf::from("/etc/amnezia/amneziawg"),
            state_file: PathBuf::from("/etc/amnezia/web_config.json"),
            defaults: ServerDefaults::default(),
            auto_start_servers: true,
            enable_geoip: true,
            public_ip: PUBLIC_IP_PLACEHOLDER.to_string(),
            poll_interval_secs: 7,
            status_persist_interval_secs: 60,
            command_timeout_secs: 30,
            tools: ToolPaths::default(),
            firewall: FirewallScripts::default(),
        }
    }
}

impl Settings {
    /// Settings rooted at `dir`, with the tunnel directory and state file
    /// inside it.
    #[must_use]
    pub fn rooted_at(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            config_dir: dir.to_path_buf(),
            tunnel_dir: dir.join("amneziawg"),
            state_file: dir.join("web_config.json"),
            ..Self::default()
        }
    }

    /// Load settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ControlError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse settings from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ControlError::Config(format!("invalid TOML: {e}")))
    }

    /// Override fields from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but unparseable.
    pub fn apply_process_env(&mut self) -> Result<()> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Override fields from variables resolved through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but unparseable.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("AUTO_START_SERVERS") {
            self.auto_start_servers = parse_bool(&v, self.auto_start_servers);
            self.defaults.auto_start = self.auto_start_servers;
        }
        if let Some(v) = lookup("DEFAULT_MTU") {
            self.defaults.mtu = v
                .trim()
                .parse()
                .map_err(|_| ControlError::Config(format!("DEFAULT_MTU is not a number: {v}")))?;
        }
        if let Some(v) = lookup("DEFAULT_SUBNET") {
            self.defaults.subnet = v
                .trim()
                .parse()
                .map_err(|_| ControlError::Config(format!("DEFAULT_SUBNET is not a CIDR: {v}")))?;
        }
        if let Some(v) = lookup("DEFAULT_PORT") {
            self.defaults.port = v
                .trim()
                .parse()
                .map_err(|_| ControlError::Config(format!("DEFAULT_PORT is not a port: {v}")))?;
        }
        if let Some(v) = lookup("DEFAULT_DNS") {
            self.defaults.dns =
                parse_dns_list(&v).map_err(|e| ControlError::Config(format!("DEFAULT_DNS: {e}")))?;
        }
        if let Some(v) = lookup("ENABLE_NAT") {
            self.defaults.enable_nat = parse_bool(&v, self.defaults.enable_nat);
        }
        if let Some(v) = lookup("BLOCK_LAN_CIDRS") {
            self.defaults.block_lan_cidrs = parse_bool(&v, self.defaults.block_lan_cidrs);
        }
        if let Some(v) = lookup("ENABLE_GEOIP") {
            self.enable_geoip = parse_bool(&v, self.enable_geoip);
        }
        if let Some(v) = lookup("PUBLIC_IP") {
            let v = v.trim();
            if !v.is_empty() {
                self.public_ip = v.to_string();
            }
        }
        Ok(())
    }

    /// Validate the settings.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        check_mtu(self.defaults.mtu).map_err(|e| ControlError::Config(e.to_string()))?;

        if self.defaults.subnet.prefix_len() > 30 {
            return Err(ControlError::Config(format!(
                "default subnet {} leaves no room for clients",
                self.defaults.subnet
            )));
        }
        if self.poll_interval_secs == 0 {
            return Err(ControlError::Config(
                "poll_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err(ControlError::Config(
                "command_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.public_ip.trim().is_empty() || self.public_ip.contains(char::is_whitespace) {
            return Err(ControlError::Config(format!(
                "public_ip must be a single host, got {:?}",
                self.public_ip
            )));
        }
        Ok(())
    }

    /// Traffic reconciliation interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Minimum spacing of status-driven document writes.
    #[must_use]
    pub fn status_persist_interval(&self) -> Duration {
        Duration::from_secs(self.status_persist_interval_secs)
    }

    /// Timeout for every external command.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}
