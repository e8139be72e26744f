//! Control plane for AmneziaWG tunnels.
//!
//! The [`Controller`] owns the [`EntityStore`] behind a single-writer lock
//! and keeps three things consistent: the persisted document, each server's
//! configuration file, and the live interfaces. The [`TrafficReconciler`]
//! runs beside it, folding peer handshakes into client status through the
//! same store.
//!
//! ```rust,no_run
//! # async fn example() -> awg_control::Result<()> {
//! use awg_control::{Controller, CreateServer, ScriptFirewall, Settings};
//! use awg_wireguard::AwgCli;
//!
//! let settings = Settings::default();
//! let tunnel = AwgCli::new(settings.tools.clone(), settings.command_timeout());
//! let firewall = ScriptFirewall::new(settings.firewall.clone(), settings.command_timeout());
//! let controller = Controller::init(settings, tunnel, firewall)?;
//!
//! let server = controller.create_server(CreateServer::default()).await?;
//! let client = controller.add_client(&server.id, "alice", None).await?;
//! let export = controller.client_config(&server.id, &client.id, true).await?;
//! println!("{}", export.content);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod controller;
pub mod error;
pub mod events;
pub mod firewall;
pub mod geoip;
pub mod model;
pub mod query;
pub mod reconciler;
pub mod settings;
pub mod store;

pub use controller::{
    ClientConfigFile, Controller, CreateServer, NetworkingOutcome, NetworkingUpdate,
};
pub use error::{ControlError, Result};
pub use events::{ClientTraffic, ControlEvent, ServerTraffic};
pub use firewall::{Firewall, FirewallCall, FirewallRules, RecordingFirewall, ScriptFirewall};
pub use geoip::{GeoLocation, GeoLocator};
pub use model::{Client, ClientStatus, Document, SCHEMA_VERSION, Server, ServerStatus};
pub use query::{ServerConfigFile, ServerInfo, SystemStatus};
pub use reconciler::{PersistThrottle, TrafficReconciler};
pub use settings::{FirewallScripts, ServerDefaults, Settings};
pub use store::EntityStore;
