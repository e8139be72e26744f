//! AmneziaWG building blocks for the tunnel control plane.
//!
//! - [`keys`]: key types and the [`KeyProvider`] with its random fallback
//! - [`obfuscation`]: generation and validation of obfuscation parameters
//! - [`config`]: marker-delimited server config editing and client export
//! - [`show`]: parsing of the peer status dump
//! - [`interface`]: the [`TunnelInterface`] seam, with [`AwgCli`] and
//!   [`FakeTunnelInterface`] implementations

pub mod cli;
pub mod config;
pub mod error;
pub mod interface;
pub mod keys;
pub mod obfuscation;
pub mod show;

pub use cli::{AwgCli, ToolPaths};
pub use config::{
    ClientExport, ServerConf, ServerInterface, render_client_config, render_server_interface,
    safe_filename, write_atomic,
};
pub use error::{Result, WireGuardError};
pub use interface::{FakeTunnelInterface, TunnelInterface};
pub use keys::{KEY_SIZE, KeyPair, KeyProvider, PresharedKey, PrivateKey, PublicKey};
pub use obfuscation::{IParams, IParamsUpdate, MAX_MTU, MIN_MTU, ObfuscationParams, check_mtu, sanitize_value};
pub use show::{PeerStats, endpoint_ip, is_active, parse_handshake_seconds, parse_show};
