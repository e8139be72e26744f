//! Read-side projections for the transport layer.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Instant;

use awg_wireguard::{ObfuscationParams, PublicKey, ServerConf, TunnelInterface};
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::controller::Controller;
use crate::error::{ControlError, Result};
use crate::events::ServerTraffic;
use crate::firewall::Firewall;
use crate::model::{Client, Server, ServerStatus};
use crate::settings::ServerDefaults;

/// Lines of the configuration file shown in [`ServerInfo`].
pub const CONFIG_PREVIEW_LINES: usize = 10;

/// Detail view of one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Protocol tag.
    pub protocol: String,
    /// UDP listen port.
    pub port: u16,
    /// Live status.
    pub status: ServerStatus,
    /// Interface name.
    pub interface: String,
    /// Configuration file path.
    pub config_path: PathBuf,
    /// Endpoint host.
    pub public_ip: String,
    /// Server tunnel address.
    pub server_ip: Ipv4Addr,
    /// Tunnel subnet.
    pub subnet: Ipv4Net,
    /// Interface MTU.
    pub mtu: u16,
    /// Whether obfuscation is on.
    pub obfuscation_enabled: bool,
    /// Obfuscation parameters.
    pub obfuscation_params: Option<ObfuscationParams>,
    /// NAT flag.
    pub enable_nat: bool,
    /// LAN-blocking flag.
    pub block_lan_cidrs: bool,
    /// Number of clients.
    pub clients_count: usize,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// First lines of the configuration file; empty if it is missing.
    pub config_preview: Vec<String>,
    /// Server public key.
    pub public_key: PublicKey,
    /// DNS servers pushed to clients.
    pub dns: Vec<Ipv4Addr>,
}

/// Raw server configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfigFile {
    /// Server id.
    pub server_id: String,
    /// Display name.
    pub server_name: String,
    /// File path.
    pub config_path: PathBuf,
    /// File content.
    pub config_content: String,
    /// Interface name.
    pub interface: String,
    /// Server public key.
    pub public_key: PublicKey,
}

/// System-wide status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Whether the tunnel tooling is installed.
    pub awg_available: bool,
    /// Endpoint host for new servers.
    pub public_ip: String,
    /// Number of servers.
    pub total_servers: usize,
    /// Number of clients.
    pub total_clients: usize,
    /// Number of servers observed running.
    pub active_servers: usize,
    /// Time of the report.
    pub timestamp: DateTime<Utc>,
    /// Whether servers are started on daemon startup.
    pub auto_start_servers: bool,
    /// Defaults for new servers.
    pub defaults: ServerDefaults,
}

impl<I, F> Controller<I, F>
where
    I: TunnelInterface + Clone + 'static,
    F: Firewall,
{
    /// Every server with its status observed live.
    ///
    /// The document is saved only if an observed status differs from the
    /// cached one, so repeated calls without changes write nothing.
    pub async fn list_servers(&self) -> Vec<Server> {
        let mut store = self.store.write().await;
        let ids: Vec<String> = store.servers().iter().map(|s| s.id.clone()).collect();
        let mut changed = false;
        for id in &ids {
            if let Ok((_, c)) = self.observe_status(&mut store, id).await {
                changed |= c;
            }
        }
        if changed {
            if let Err(e) = store.save() {
                warn!(error = %e, "failed to persist observed server status");
            }
        }
        store.servers().to_vec()
    }

    /// Clients, optionally limited to one server, oldest first.
    pub async fn list_clients(&self, server_id: Option<&str>) -> Vec<Client> {
        let store = self.store.read().await;
        let mut clients: Vec<Client> = store
            .clients()
            .filter(|c| server_id.is_none_or(|id| c.server_id == id))
            .cloned()
            .collect();
        clients.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        clients
    }

    /// Detail view of one server, with live status and a config preview.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::ServerNotFound`] for an unknown id.
    pub async fn server_info(&self, server_id: &str) -> Result<ServerInfo> {
        let mut store = self.store.write().await;
        let status = self.refresh_status(&mut store, server_id).await?;
        let server = store.server(server_id)?;

        let config_preview = match std::fs::read_to_string(&server.config_path) {
            Ok(text) => ServerConf::parse(&text).preview(CONFIG_PREVIEW_LINES),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(server_id, error = %e, "unable to read config file for preview");
                }
                Vec::new()
            }
        };

        Ok(ServerInfo {
            id: server.id.clone(),
            name: server.name.clone(),
            protocol: server.protocol.clone(),
            port: server.port,
            status,
            interface: server.interface.clone(),
            config_path: server.config_path.clone(),
            public_ip: server.public_ip.clone(),
            server_ip: server.server_ip,
            subnet: server.subnet,
            mtu: server.mtu,
            obfuscation_enabled: server.obfuscation_enabled,
            obfuscation_params: server.obfuscation_params.clone(),
            enable_nat: server.enable_nat,
            block_lan_cidrs: server.block_lan_cidrs,
            clients_count: server.clients.len(),
            created_at: server.created_at,
            config_preview,
            public_key: server.server_public_key,
            dns: server.dns.clone(),
        })
    }

    /// The server's configuration file as written on disk.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::ServerNotFound`] for an unknown id and an I/O
    /// error if the file cannot be read.
    pub async fn server_config(&self, server_id: &str) -> Result<ServerConfigFile> {
        let store = self.store.read().await;
        let server = store.server(server_id)?;
        let config_content = std::fs::read_to_string(&server.config_path)?;
        Ok(ServerConfigFile {
            server_id: server.id.clone(),
            server_name: server.name.clone(),
            config_path: server.config_path.clone(),
            config_content,
            interface: server.interface.clone(),
            public_key: server.server_public_key,
        })
    }

    /// Totals, tool availability and defaults.
    pub async fn system_status(&self) -> SystemStatus {
        let awg_available = self.tunnel.tools_available().await;
        let servers = self.list_servers().await;
        let total_clients = self.store.read().await.clients().count();

        SystemStatus {
            awg_available,
            public_ip: self.public_ip(),
            total_servers: servers.len(),
            total_clients,
            active_servers: servers
                .iter()
                .filter(|s| s.status == ServerStatus::Running)
                .count(),
            timestamp: Utc::now(),
            auto_start_servers: self.settings.auto_start_servers,
            defaults: self.settings.defaults.clone(),
        }
    }

    /// One-shot reconciliation of a single server.
    ///
    /// A stopped server reports no traffic.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::ServerNotFound`] for an unknown id, or the
    /// failure of the status dump.
    pub async fn server_traffic(&self, server_id: &str) -> Result<ServerTraffic> {
        let interface = {
            let store = self.store.read().await;
            store
                .get_server(server_id)
                .map(|s| s.interface.clone())
                .ok_or_else(|| ControlError::ServerNotFound(server_id.to_string()))?
        };
        if !self.tunnel.is_up(&interface).await {
            return Ok(ServerTraffic::new());
        }

        let reconciler = self.reconciler();
        let traffic = reconciler.reconcile_server(server_id).await?;
        reconciler.persist_if_due(Instant::now()).await;
        Ok(traffic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::CreateServer;
    use crate::firewall::RecordingFirewall;
    use crate::settings::Settings;
    use awg_wireguard::FakeTunnelInterface;

    async fn controller_with_server() -> (
        tempfile::TempDir,
        Controller<FakeTunnelInterface, RecordingFirewall>,
        FakeTunnelInterface,
        Server,
    ) {
        let dir = tempfile::tempdir().expect("tempdir");
        let tunnel = FakeTunnelInterface::new();
        let controller = Controller::init(
            Settings::rooted_at(dir.path()),
            tunnel.clone(),
            RecordingFirewall::new(),
        )
        .expect("init");
        let server = controller
            .create_server(CreateServer {
                name: Some("Main".to_string()),
                auto_start: Some(false),
                obfuscation: Some(false),
                ..CreateServer::default()
            })
            .await
            .expect("create");
        (dir, controller, tunnel, server)
    }

    #[tokio::test]
    async fn test_list_servers_is_idempotent() {
        let (_dir, controller, tunnel, server) = controller_with_server().await;
        tunnel.set_up(&server.interface, true);

        let first = controller.list_servers().await;
        assert_eq!(first[0].status, ServerStatus::Running);
        let saved = std::fs::read_to_string(&controller.settings().state_file).expect("state");

        let second = controller.list_servers().await;
        assert_eq!(first, second);
        let saved_again = std::fs::read_to_string(&controller.settings().state_file).expect("state");
        assert_eq!(saved, saved_again);
        assert_eq!(controller.snapshot().await.servers.len(), 1);
    }

    #[tokio::test]
    async fn test_server_info_preview() {
        let (_dir, controller, _tunnel, server) = controller_with_server().await;
        let info = controller.server_info(&server.id).await.expect("info");
        assert_eq!(info.status, ServerStatus::Stopped);
        assert_eq!(info.clients_count, 0);
        assert_eq!(info.config_preview[0], "[Interface]");
        assert!(info.config_preview.len() <= CONFIG_PREVIEW_LINES);
        assert!(info.config_preview.iter().any(|l| l == "Address = 10.0.0.1/24"));

        std::fs::remove_file(&server.config_path).expect("remove");
        let info = controller.server_info(&server.id).await.expect("info");
        assert!(info.config_preview.is_empty());
        assert!(controller.server_config(&server.id).await.is_err());
    }

    #[tokio::test]
    async fn test_list_clients_filters_and_orders() {
        let (_dir, controller, _tunnel, server) = controller_with_server().await;
        let other = controller
            .create_server(CreateServer {
                subnet: Some("10.9.0.0/24".to_string()),
                auto_start: Some(false),
                ..CreateServer::default()
            })
            .await
            .expect("other");

        let a = controller.add_client(&server.id, "a", None).await.expect("a");
        let b = controller.add_client(&server.id, "b", None).await.expect("b");
        controller.add_client(&other.id, "c", None).await.expect("c");

        let ids: Vec<String> = controller
            .list_clients(Some(&server.id))
            .await
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id) && ids.contains(&b.id));
        assert_eq!(controller.list_clients(None).await.len(), 3);
    }

    #[tokio::test]
    async fn test_system_status_totals() {
        let (_dir, controller, tunnel, server) = controller_with_server().await;
        controller.add_client(&server.id, "a", None).await.expect("a");
        tunnel.set_up(&server.interface, true);

        let status = controller.system_status().await;
        assert!(status.awg_available);
        assert_eq!(status.total_servers, 1);
        assert_eq!(status.total_clients, 1);
        assert_eq!(status.active_servers, 1);
        assert_eq!(status.defaults.mtu, 1280);
    }

    #[tokio::test]
    async fn test_traffic_of_stopped_server_is_empty() {
        let (_dir, controller, tunnel, server) = controller_with_server().await;
        controller.add_client(&server.id, "a", None).await.expect("a");
        let traffic = controller.server_traffic(&server.id).await.expect("traffic");
        assert!(traffic.is_empty());
        assert_eq!(tunnel.call_count("show "), 0);
        assert!(controller.server_traffic("missing").await.is_err());
    }
}
