//! Lifecycle controller.
//!
//! Every mutating operation holds the store's write lock from validation to
//! the final save, so mutations never interleave. External commands run
//! while the lock is held.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use awg_wireguard::{
    ClientExport, IParamsUpdate, KeyProvider, ObfuscationParams, ServerConf, ServerInterface,
    TunnelInterface, check_mtu, render_client_config, render_server_interface, safe_filename,
    sanitize_value, write_atomic,
};
use chrono::{Local, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::error::{ControlError, Result};
use crate::events::{ControlEvent, EVENT_CHANNEL_CAPACITY};
use crate::firewall::{Firewall, FirewallRules};
use crate::geoip::GeoLocator;
use crate::model::{Client, ClientStatus, Document, Server, ServerStatus};
use crate::reconciler::{PersistThrottle, TrafficReconciler};
use crate::settings::{Settings, parse_dns_list};
use crate::store::EntityStore;

const DEFAULT_SERVER_NAME: &str = "New Server";
const ID_LEN: usize = 6;
const MAX_PREFIX_LEN: u8 = 30;

/// Parameters for [`Controller::create_server`]; unset fields take the
/// configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateServer {
    /// Display name.
    pub name: Option<String>,
    /// UDP listen port.
    pub port: Option<u16>,
    /// Tunnel subnet in CIDR notation.
    pub subnet: Option<String>,
    /// Interface MTU.
    pub mtu: Option<u16>,
    /// DNS server literals.
    pub dns: Option<Vec<String>>,
    /// Enable obfuscation.
    pub obfuscation: Option<bool>,
    /// Use these parameters instead of generating new ones.
    pub obfuscation_params: Option<ObfuscationParams>,
    /// Start now and on daemon startup.
    pub auto_start: Option<bool>,
    /// Masquerade tunnel traffic.
    pub enable_nat: Option<bool>,
    /// Block LAN ranges for clients.
    pub block_lan_cidrs: Option<bool>,
}

/// Result of reapplying firewall rules after a networking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkingOutcome {
    /// Server not running; nothing to reapply.
    Skipped,
    /// Rules were removed and installed again.
    Reapplied,
    /// Rule installation failed; the flags are still saved.
    Failed,
}

/// Networking flags after an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkingUpdate {
    /// Server id.
    pub server_id: String,
    /// Saved NAT flag.
    pub enable_nat: bool,
    /// Saved LAN-blocking flag.
    pub block_lan_cidrs: bool,
    /// What happened to the live firewall rules.
    pub firewall: NetworkingOutcome,
}

/// A rendered client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfigFile {
    /// Suggested download name.
    pub filename: String,
    /// File content.
    pub content: String,
}

/// Owns the entity store and drives tunnels, config files and firewall
/// rules.
///
/// Cloning is cheap; clones share the same store.
pub struct Controller<I, F> {
    pub(crate) store: Arc<RwLock<EntityStore>>,
    pub(crate) tunnel: I,
    firewall: F,
    keys: KeyProvider<I>,
    pub(crate) settings: Arc<Settings>,
    pub(crate) events: broadcast::Sender<ControlEvent>,
    pub(crate) geo: Arc<GeoLocator>,
    pub(crate) public_ip: Arc<parking_lot::RwLock<String>>,
    pub(crate) throttle: Arc<parking_lot::Mutex<PersistThrottle>>,
}

impl<I: Clone, F: Clone> Clone for Controller<I, F> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            tunnel: self.tunnel.clone(),
            firewall: self.firewall.clone(),
            keys: self.keys.clone(),
            settings: Arc::clone(&self.settings),
            events: self.events.clone(),
            geo: Arc::clone(&self.geo),
            public_ip: Arc::clone(&self.public_ip),
            throttle: Arc::clone(&self.throttle),
        }
    }
}

impl<I, F> Controller<I, F>
where
    I: TunnelInterface + Clone + 'static,
    F: Firewall,
{
    /// Validates settings, creates the directories and loads the state
    /// document.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid settings, unwritable directories or a
    /// malformed state document.
    pub fn init(settings: Settings, tunnel: I, firewall: F) -> Result<Self> {
        settings.validate()?;
        for dir in [&settings.config_dir, &settings.tunnel_dir] {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(parent) = settings.state_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut store = EntityStore::open(&settings.state_file)?;
        if store.is_dirty() {
            // Keys filled in during the upgrade must survive a restart.
            if let Err(e) = store.save() {
                warn!(error = %e, "failed to write upgraded state document");
            }
        }
        info!(
            state_file = %settings.state_file.display(),
            servers = store.servers().len(),
            "control plane initialized"
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            store: Arc::new(RwLock::new(store)),
            keys: KeyProvider::new(tunnel.clone()),
            tunnel,
            firewall,
            geo: Arc::new(GeoLocator::new(settings.enable_geoip)),
            public_ip: Arc::new(parking_lot::RwLock::new(settings.public_ip.clone())),
            throttle: Arc::new(parking_lot::Mutex::new(PersistThrottle::new(
                settings.status_persist_interval(),
            ))),
            settings: Arc::new(settings),
            events,
        })
    }

    /// Replaces the endpoint locator.
    #[must_use]
    pub fn with_geo(mut self, geo: GeoLocator) -> Self {
        self.geo = Arc::new(geo);
        self
    }

    /// Flushes unsaved changes.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Persistence`] if the final write fails.
    pub async fn shutdown(&self) -> Result<()> {
        let mut store = self.store.write().await;
        if store.is_dirty() {
            store.save()?;
            info!("state document flushed on shutdown");
        }
        Ok(())
    }

    /// Subscribes to status and traffic events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    /// A reconciler sharing this controller's store.
    #[must_use]
    pub fn reconciler(&self) -> TrafficReconciler<I> {
        TrafficReconciler::new(
            Arc::clone(&self.store),
            self.tunnel.clone(),
            Arc::clone(&self.geo),
            self.events.clone(),
            Arc::clone(&self.throttle),
        )
    }

    /// The loaded settings.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Endpoint host written into new servers.
    #[must_use]
    pub fn public_ip(&self) -> String {
        self.public_ip.read().clone()
    }

    /// A copy of the whole document.
    pub async fn snapshot(&self) -> Document {
        self.store.read().await.document().clone()
    }

    pub(crate) fn publish(&self, event: ControlEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }

    /// Creates a server, writes its configuration file and persists it.
    ///
    /// A server with auto-start is started right away; a failed start is
    /// logged and the server is returned stopped.
    ///
    /// # Errors
    ///
    /// Returns a validation error before any side effect for a bad MTU, DNS
    /// entry, subnet, port or obfuscation parameter set. Returns an I/O or
    /// persistence error if the configuration file or document cannot be
    /// written; nothing is left behind in that case.
    pub async fn create_server(&self, request: CreateServer) -> Result<Server> {
        let defaults = &self.settings.defaults;

        let mtu = request.mtu.unwrap_or(defaults.mtu);
        check_mtu(mtu).map_err(|e| ControlError::validation(e.to_string()))?;

        let dns = match &request.dns {
            Some(entries) if !entries.is_empty() => parse_dns_list(&entries.join(","))?,
            _ => defaults.dns.clone(),
        };

        let subnet = match request.subnet.as_deref() {
            Some(text) => parse_subnet(text)?,
            None => defaults.subnet.trunc(),
        };

        let port = request.port.unwrap_or(defaults.port);
        if port == 0 {
            return Err(ControlError::validation("port must be non-zero"));
        }

        let name = request
            .name
            .as_deref()
            .map(sanitize_value)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string());

        let obfuscation_enabled = request.obfuscation.unwrap_or(defaults.obfuscation);
        let obfuscation_params = if obfuscation_enabled {
            Some(obfuscation_for(mtu, request.obfuscation_params)?)
        } else {
            None
        };

        let mut store = self.store.write().await;

        let id = unique_id(|candidate| store.get_server(candidate).is_some());
        let interface = Server::interface_name(&id);
        let config_path = self.settings.tunnel_dir.join(format!("{interface}.conf"));
        let server_ip = host_at(subnet, 1)
            .ok_or_else(|| ControlError::validation(format!("subnet {subnet} has no hosts")))?;

        let (private_key, public_key) = self.keys.generate_keypair().await.into_parts();

        let content = render_server_interface(&ServerInterface {
            private_key: &private_key,
            address: server_ip,
            prefix_len: subnet.prefix_len(),
            listen_port: port,
            mtu,
            obfuscation: obfuscation_params.as_ref(),
        });
        write_atomic(&config_path, content.as_bytes())?;

        let server = Server {
            id: id.clone(),
            name,
            protocol: "wireguard".to_string(),
            port,
            status: ServerStatus::Stopped,
            interface,
            config_path,
            server_public_key: public_key,
            server_private_key: private_key,
            subnet,
            server_ip,
            mtu,
            public_ip: self.public_ip(),
            obfuscation_enabled,
            obfuscation_params,
            auto_start: request.auto_start.unwrap_or(defaults.auto_start),
            enable_nat: request.enable_nat.unwrap_or(defaults.enable_nat),
            block_lan_cidrs: request.block_lan_cidrs.unwrap_or(defaults.block_lan_cidrs),
            dns,
            clients: Vec::new(),
            created_at: Utc::now(),
        };

        store.upsert_server(server.clone());
        if let Err(e) = store.save() {
            if let Err(undo) = store.delete_server(&id) {
                warn!(server_id = %id, error = %undo, "failed to drop server record after error");
            }
            remove_file_logged(&server.config_path);
            return Err(e);
        }
        info!(server_id = %id, interface = %server.interface, subnet = %subnet, "server created");

        if server.auto_start {
            if let Err(e) = self.start_locked(&mut store, &id).await {
                warn!(server_id = %id, error = %e, "auto-start of new server failed");
            }
        }

        Ok(store.server(&id)?.clone())
    }

    /// Brings a server's interface up and installs its firewall rules.
    ///
    /// Starting a server whose interface is already up only refreshes the
    /// cached status. A firewall failure is logged and the server still
    /// counts as running.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InterfaceUp`] if the interface cannot be
    /// brought up; the server stays stopped.
    pub async fn start_server(&self, server_id: &str) -> Result<ServerStatus> {
        let mut store = self.store.write().await;
        self.start_locked(&mut store, server_id).await
    }

    /// Removes a server's firewall rules and brings its interface down.
    ///
    /// Stopping a server whose interface is already down only refreshes the
    /// cached status.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InterfaceDown`] if the interface cannot be
    /// brought down; the server stays running.
    pub async fn stop_server(&self, server_id: &str) -> Result<ServerStatus> {
        let mut store = self.store.write().await;
        self.stop_locked(&mut store, server_id).await
    }

    async fn start_locked(&self, store: &mut EntityStore, server_id: &str) -> Result<ServerStatus> {
        let server = store.server(server_id)?.clone();

        if self.tunnel.is_up(&server.interface).await {
            debug!(server_id, "interface already up");
            if store.set_server_status(server_id, ServerStatus::Running) {
                store.save()?;
            }
            return Ok(ServerStatus::Running);
        }

        if let Err(source) = self.tunnel.up(&server.interface).await {
            if store.set_server_status(server_id, ServerStatus::Stopped) {
                if let Err(e) = store.save() {
                    warn!(server_id, error = %e, "failed to persist stopped status");
                }
            }
            return Err(ControlError::InterfaceUp {
                interface: server.interface,
                source,
            });
        }

        if let Err(e) = self.firewall.setup(&firewall_rules(&server)).await {
            warn!(
                server_id,
                interface = %server.interface,
                error = %e,
                "firewall setup failed, server is running without its rules"
            );
        }

        store.set_server_status(server_id, ServerStatus::Running);
        store.save()?;
        info!(server_id, interface = %server.interface, "server started");
        self.publish(ControlEvent::ServerStatus {
            server_id: server_id.to_string(),
            status: ServerStatus::Running,
        });
        Ok(ServerStatus::Running)
    }

    async fn stop_locked(&self, store: &mut EntityStore, server_id: &str) -> Result<ServerStatus> {
        let server = store.server(server_id)?.clone();

        if !self.tunnel.is_up(&server.interface).await {
            debug!(server_id, "interface already down");
            if store.set_server_status(server_id, ServerStatus::Stopped) {
                store.save()?;
            }
            return Ok(ServerStatus::Stopped);
        }

        if let Err(e) = self.firewall.cleanup(&firewall_rules(&server)).await {
            warn!(
                server_id,
                interface = %server.interface,
                error = %e,
                "firewall cleanup failed"
            );
        }

        self.tunnel
            .down(&server.interface)
            .await
            .map_err(|source| ControlError::InterfaceDown {
                interface: server.interface.clone(),
                source,
            })?;

        store.set_server_status(server_id, ServerStatus::Stopped);
        store.save()?;
        info!(server_id, interface = %server.interface, "server stopped");
        self.publish(ControlEvent::ServerStatus {
            server_id: server_id.to_string(),
            status: ServerStatus::Stopped,
        });
        Ok(ServerStatus::Stopped)
    }

    /// Observes a server's live status and refreshes the cached field.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::ServerNotFound`] for an unknown id.
    pub async fn server_status(&self, server_id: &str) -> Result<ServerStatus> {
        let mut store = self.store.write().await;
        self.refresh_status(&mut store, server_id).await
    }

    /// Live status of one server; the cached field is updated and the
    /// document saved only when the status changed.
    pub(crate) async fn refresh_status(
        &self,
        store: &mut EntityStore,
        server_id: &str,
    ) -> Result<ServerStatus> {
        let (status, changed) = self.observe_status(store, server_id).await?;
        if changed {
            if let Err(e) = store.save() {
                warn!(server_id, error = %e, "failed to persist observed status");
            }
        }
        Ok(status)
    }

    /// Live status of one server written into the cache without saving.
    /// Returns the status and whether the cached value changed.
    pub(crate) async fn observe_status(
        &self,
        store: &mut EntityStore,
        server_id: &str,
    ) -> Result<(ServerStatus, bool)> {
        let interface = store.server(server_id)?.interface.clone();
        let status = if self.tunnel.is_up(&interface).await {
            ServerStatus::Running
        } else {
            ServerStatus::Stopped
        };
        Ok((status, store.set_server_status(server_id, status)))
    }

    /// Stops a server if needed, removes its configuration file, its clients
    /// and its record.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::ServerNotFound`] for an unknown id or a
    /// persistence error if the document cannot be saved.
    pub async fn delete_server(&self, server_id: &str) -> Result<Server> {
        let mut store = self.store.write().await;
        let server = store.server(server_id)?.clone();

        if self.tunnel.is_up(&server.interface).await {
            if let Err(e) = self.stop_locked(&mut store, server_id).await {
                warn!(server_id, error = %e, "failed to stop server before deletion");
            }
        }

        remove_file_logged(&server.config_path);
        let removed = store.delete_server(server_id)?;
        store.save()?;
        info!(server_id, clients = removed.clients.len(), "server deleted");
        Ok(removed)
    }

    /// Adds a client to a server.
    ///
    /// The peer block is written to the configuration file before the client
    /// is recorded; if recording fails the block is removed again. A running
    /// server is reloaded live, and a failed reload is only logged.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::ServerNotFound`] for an unknown server, a
    /// validation error for an empty, multi-line or duplicate name or an
    /// exhausted subnet, and I/O or persistence errors from the writes.
    pub async fn add_client(
        &self,
        server_id: &str,
        name: &str,
        i_params: Option<&IParamsUpdate>,
    ) -> Result<Client> {
        let name = validate_client_name(name)?;

        let mut store = self.store.write().await;
        let server = store.server(server_id)?.clone();
        if server.has_client_named(&name) {
            return Err(ControlError::validation(format!(
                "client '{name}' already exists on server {server_id}"
            )));
        }
        let client_ip = next_client_ip(&server)?;

        let (client_private_key, client_public_key) =
            self.keys.generate_keypair().await.into_parts();
        let preshared_key = self.keys.generate_preshared().await;

        let obfuscation_params = if server.obfuscation_enabled {
            server.obfuscation_params.clone().map(|mut params| {
                if let Some(update) = i_params {
                    update.apply_to(&mut params.i_params);
                }
                params
            })
        } else {
            None
        };

        let id = unique_id(|candidate| store.get_client(candidate).is_some());
        let client = Client {
            id: id.clone(),
            name: name.clone(),
            server_id: server_id.to_string(),
            server_name: server.name.clone(),
            status: ClientStatus::Inactive,
            created_at: Utc::now(),
            client_private_key,
            client_public_key,
            preshared_key,
            client_ip,
            obfuscation_enabled: server.obfuscation_enabled,
            obfuscation_params,
        };

        let mut conf = ServerConf::load(&server.config_path)?;
        conf.append_peer(&name, &client.client_public_key, &client.preshared_key, client_ip);
        conf.save(&server.config_path)?;

        if let Err(e) = store.upsert_client(client.clone()).and_then(|()| store.save()) {
            if let Err(undo) = store.delete_client(&id) {
                warn!(server_id, client_id = %id, error = %undo, "failed to drop client record after error");
            }
            if conf.remove_peer(&name) {
                if let Err(undo) = conf.save(&server.config_path) {
                    warn!(server_id, client = %name, error = %undo, "failed to remove peer block after error");
                }
            }
            return Err(e);
        }
        info!(server_id, client_id = %id, client_ip = %client_ip, "client added");

        self.reload_live(&server).await;
        Ok(client)
    }

    /// Removes a client from the configuration file, the client map and the
    /// server's mirror, then reloads a running server live.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the server is unknown or the client does
    /// not belong to it, and I/O or persistence errors from the writes.
    pub async fn delete_client(&self, server_id: &str, client_id: &str) -> Result<Client> {
        let mut store = self.store.write().await;
        let server = store.server(server_id)?.clone();
        let client = store
            .get_client(client_id)
            .filter(|c| c.server_id == server_id)
            .cloned()
            .ok_or_else(|| ControlError::ClientNotFound(client_id.to_string()))?;

        let mut conf = ServerConf::load(&server.config_path)?;
        if conf.remove_peer(&client.name) {
            conf.save(&server.config_path)?;
        } else {
            warn!(server_id, client = %client.name, "no peer block found for client");
        }

        let removed = store.delete_client(client_id)?;
        store.save()?;
        info!(server_id, client_id, "client deleted");

        self.reload_live(&server).await;
        Ok(removed)
    }

    async fn reload_live(&self, server: &Server) {
        if !self.tunnel.is_up(&server.interface).await {
            return;
        }
        match self.tunnel.sync(&server.interface).await {
            Ok(()) => debug!(server_id = %server.id, "live config applied"),
            Err(e) => warn!(
                server_id = %server.id,
                interface = %server.interface,
                error = %e,
                "live config reload failed"
            ),
        }
    }

    /// Updates the server-level `I1`..`I5` defaults used for new clients.
    ///
    /// The configuration file and existing clients are not touched.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown server and a validation error
    /// if the server has no obfuscation parameters.
    pub async fn update_server_i_params(
        &self,
        server_id: &str,
        update: &IParamsUpdate,
    ) -> Result<Server> {
        let mut store = self.store.write().await;
        if store.server(server_id)?.obfuscation_params.is_none() {
            return Err(ControlError::validation(format!(
                "server {server_id} has no obfuscation parameters"
            )));
        }
        let server = store.update_server(server_id, |s| {
            if let Some(params) = s.obfuscation_params.as_mut() {
                update.apply_to(&mut params.i_params);
            }
        })?;
        store.save()?;
        info!(server_id, "server I-params updated");
        Ok(server)
    }

    /// Updates one client's own `I1`..`I5` values.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the server is unknown or the client does
    /// not belong to it, and a validation error if the client has no
    /// obfuscation parameters.
    pub async fn update_client_i_params(
        &self,
        server_id: &str,
        client_id: &str,
        update: &IParamsUpdate,
    ) -> Result<Client> {
        let mut store = self.store.write().await;
        store.server(server_id)?;
        let owned = store
            .get_client(client_id)
            .filter(|c| c.server_id == server_id)
            .ok_or_else(|| ControlError::ClientNotFound(client_id.to_string()))?;
        if owned.obfuscation_params.is_none() {
            return Err(ControlError::validation(format!(
                "client {client_id} has no obfuscation parameters"
            )));
        }

        let client = store.update_client(client_id, |c| {
            if let Some(params) = c.obfuscation_params.as_mut() {
                update.apply_to(&mut params.i_params);
            }
        })?;
        store.save()?;
        info!(server_id, client_id, "client I-params updated");
        Ok(client)
    }

    /// Saves new networking flags and reapplies firewall rules on a running
    /// server.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for an unknown server or a persistence error.
    pub async fn update_networking(
        &self,
        server_id: &str,
        enable_nat: Option<bool>,
        block_lan_cidrs: Option<bool>,
    ) -> Result<NetworkingUpdate> {
        let mut store = self.store.write().await;
        let server = store.update_server(server_id, |s| {
            if let Some(v) = enable_nat {
                s.enable_nat = v;
            }
            if let Some(v) = block_lan_cidrs {
                s.block_lan_cidrs = v;
            }
        })?;
        store.save()?;

        let firewall = if self.refresh_status(&mut store, server_id).await? == ServerStatus::Running {
            let rules = firewall_rules(&server);
            if let Err(e) = self.firewall.cleanup(&rules).await {
                debug!(server_id, error = %e, "firewall cleanup before reapply failed");
            }
            match self.firewall.setup(&rules).await {
                Ok(()) => NetworkingOutcome::Reapplied,
                Err(e) => {
                    warn!(server_id, error = %e, "firewall reapply failed");
                    NetworkingOutcome::Failed
                }
            }
        } else {
            NetworkingOutcome::Skipped
        };

        info!(
            server_id,
            enable_nat = server.enable_nat,
            block_lan_cidrs = server.block_lan_cidrs,
            ?firewall,
            "networking updated"
        );
        Ok(NetworkingUpdate {
            server_id: server_id.to_string(),
            enable_nat: server.enable_nat,
            block_lan_cidrs: server.block_lan_cidrs,
            firewall,
        })
    }

    /// Renders a client's configuration file.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the server is unknown or the client does
    /// not belong to it.
    pub async fn client_config(
        &self,
        server_id: &str,
        client_id: &str,
        include_comments: bool,
    ) -> Result<ClientConfigFile> {
        let store = self.store.read().await;
        let server = store.server(server_id)?;
        let client = store
            .get_client(client_id)
            .filter(|c| c.server_id == server_id)
            .ok_or_else(|| ControlError::ClientNotFound(client_id.to_string()))?;

        let obfuscation = if client.obfuscation_enabled {
            client.obfuscation_params.as_ref()
        } else {
            None
        };
        let content = render_client_config(
            &ClientExport {
                server_name: &server.name,
                client_name: &client.name,
                endpoint_host: &server.public_ip,
                port: server.port,
                private_key: &client.client_private_key,
                client_ip: client.client_ip,
                dns: &server.dns,
                mtu: server.mtu,
                obfuscation,
                server_public_key: &server.server_public_key,
                preshared_key: &client.preshared_key,
                generated_at: Local::now(),
            },
            include_comments,
        );

        Ok(ClientConfigFile {
            filename: safe_filename(&client.name, &server.name),
            content,
        })
    }

    /// Starts every auto-start server whose configuration file exists and
    /// whose interface is down. Returns the ids that were started.
    pub async fn auto_start_servers(&self) -> Vec<String> {
        if !self.settings.auto_start_servers {
            debug!("auto-start disabled");
            return Vec::new();
        }

        let mut store = self.store.write().await;
        let candidates: Vec<Server> = store
            .servers()
            .iter()
            .filter(|s| s.auto_start && s.config_path.exists())
            .cloned()
            .collect();

        let mut started = Vec::new();
        for server in candidates {
            if self.tunnel.is_up(&server.interface).await {
                continue;
            }
            match self.start_locked(&mut store, &server.id).await {
                Ok(_) => started.push(server.id),
                Err(e) => warn!(server_id = %server.id, error = %e, "auto-start failed"),
            }
        }
        if !started.is_empty() {
            info!(count = started.len(), "auto-started servers");
        }
        started
    }

    /// Sets the endpoint host for every server and for servers created later.
    ///
    /// # Errors
    ///
    /// Returns a validation error unless `ip` is an IP address or host name,
    /// or a persistence error.
    pub async fn set_public_ip(&self, ip: &str) -> Result<()> {
        let ip = ip.trim();
        if !is_valid_endpoint_host(ip) {
            return Err(ControlError::validation(format!("invalid public IP: {ip:?}")));
        }

        let mut store = self.store.write().await;
        let ids: Vec<String> = store.servers().iter().map(|s| s.id.clone()).collect();
        for id in &ids {
            store.update_server(id, |s| s.public_ip = ip.to_string())?;
        }
        store.save()?;
        *self.public_ip.write() = ip.to_string();
        info!(public_ip = %ip, servers = ids.len(), "public IP updated");
        Ok(())
    }
}

pub(crate) fn firewall_rules(server: &Server) -> FirewallRules {
    FirewallRules {
        interface: server.interface.clone(),
        subnet: server.subnet,
        enable_nat: server.enable_nat,
        block_lan_cidrs: server.block_lan_cidrs,
    }
}

fn obfuscation_for(mtu: u16, provided: Option<ObfuscationParams>) -> Result<ObfuscationParams> {
    match provided {
        Some(mut params) => {
            params
                .validate(mtu)
                .map_err(|e| ControlError::validation(e.to_string()))?;
            params.i_params = params.i_params.sanitized();
            Ok(params)
        }
        None => ObfuscationParams::generate(mtu, &mut rand::thread_rng())
            .map_err(|e| ControlError::validation(e.to_string())),
    }
}

fn parse_subnet(text: &str) -> Result<Ipv4Net> {
    let text = text.trim();
    let net: Ipv4Net = if text.contains('/') {
        text.parse()
            .map_err(|_| ControlError::validation(format!("invalid subnet: {text}")))?
    } else {
        let addr: Ipv4Addr = text
            .parse()
            .map_err(|_| ControlError::validation(format!("invalid subnet: {text}")))?;
        Ipv4Net::new(addr, 24).map_err(|_| ControlError::validation(format!("invalid subnet: {text}")))?
    };
    if net.prefix_len() > MAX_PREFIX_LEN {
        return Err(ControlError::validation(format!(
            "subnet {net} is too small, prefix must be /{MAX_PREFIX_LEN} or shorter"
        )));
    }
    Ok(net.trunc())
}

fn validate_client_name(name: &str) -> Result<String> {
    if name.contains(['\r', '\n']) {
        return Err(ControlError::validation("client name must be a single line"));
    }
    let name = name.trim();
    if name.is_empty() {
        return Err(ControlError::validation("client name must not be empty"));
    }
    Ok(name.to_string())
}

/// Host at `offset` from the network address, if it is a usable host.
fn host_at(subnet: Ipv4Net, offset: u64) -> Option<Ipv4Addr> {
    let size = 1u64 << (32 - u32::from(subnet.prefix_len()));
    if offset == 0 || offset + 1 >= size {
        return None;
    }
    let base = u64::from(u32::from(subnet.network()));
    u32::try_from(base + offset).ok().map(Ipv4Addr::from)
}

/// Address for the next client: offset `clients + 2`, or the next free
/// host if a surviving client already holds it.
pub(crate) fn next_client_ip(server: &Server) -> Result<Ipv4Addr> {
    let taken: HashSet<Ipv4Addr> = server
        .clients
        .iter()
        .map(|c| c.client_ip)
        .chain(std::iter::once(server.server_ip))
        .collect();
    let size = 1u64 << (32 - u32::from(server.subnet.prefix_len()));
    let preferred = server.clients.len() as u64 + 2;

    (preferred..size)
        .chain(2..preferred.min(size))
        .filter_map(|offset| host_at(server.subnet, offset))
        .find(|ip| !taken.contains(ip))
        .ok_or_else(|| {
            ControlError::validation(format!("no free addresses left in {}", server.subnet))
        })
}

fn unique_id(exists: impl Fn(&str) -> bool) -> String {
    loop {
        let candidate: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(ID_LEN)
            .collect();
        if !exists(&candidate) {
            return candidate;
        }
    }
}

fn is_valid_endpoint_host(host: &str) -> bool {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return true;
    }
    !host.is_empty()
        && host.len() <= 253
        && host
            .split('.')
            .all(|label| {
                !label.is_empty()
                    && label.len() <= 63
                    && !label.starts_with('-')
                    && !label.ends_with('-')
                    && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            })
}

fn remove_file_logged(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "config file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove config file"),
    }
}
