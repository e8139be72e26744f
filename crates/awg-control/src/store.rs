//! Entity store backed by a single JSON document.
//!
//! The store itself is not synchronized; the controller owns it behind one
//! `RwLock`, which is the single-writer authority for every mutation.

use std::path::{Path, PathBuf};

use awg_wireguard::write_atomic;
use tracing::{debug, info};

use crate::error::{ControlError, Result};
use crate::model::{Client, ClientStatus, Document, SCHEMA_VERSION, Server, ServerStatus};

/// In-memory document plus the path it persists to.
#[derive(Debug)]
pub struct EntityStore {
    doc: Document,
    path: PathBuf,
    dirty: bool,
}

impl EntityStore {
    /// Loads the document at `path`, or starts empty if the file is absent.
    ///
    /// Documents without a schema version are upgraded in memory and marked
    /// dirty so the next flush writes the current version.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::MalformedDocument`] if the file cannot be
    /// parsed or carries a newer schema version, and an I/O error if it
    /// cannot be read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no state document, starting empty");
                return Ok(Self::empty(path));
            }
            Err(e) => return Err(e.into()),
        };

        let mut doc: Document =
            serde_json::from_str(&text).map_err(|e| ControlError::MalformedDocument {
                path: path.clone(),
                message: e.to_string(),
            })?;

        if doc.schema_version > SCHEMA_VERSION {
            return Err(ControlError::MalformedDocument {
                path,
                message: format!(
                    "schema version {} is newer than supported version {SCHEMA_VERSION}",
                    doc.schema_version
                ),
            });
        }

        let dirty = doc.schema_version < SCHEMA_VERSION;
        if dirty {
            info!(
                from = doc.schema_version,
                to = SCHEMA_VERSION,
                "upgrading state document"
            );
            doc.schema_version = SCHEMA_VERSION;
        }

        debug!(
            servers = doc.servers.len(),
            clients = doc.clients.len(),
            "loaded state document"
        );
        Ok(Self { doc, path, dirty })
    }

    /// An empty store that will persist to `path`.
    #[must_use]
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            doc: Document::new(),
            path: path.into(),
            dirty: false,
        }
    }

    /// Backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The whole document.
    #[must_use]
    pub const fn document(&self) -> &Document {
        &self.doc
    }

    /// Servers in creation order.
    #[must_use]
    pub fn servers(&self) -> &[Server] {
        &self.doc.servers
    }

    /// Looks up a server.
    #[must_use]
    pub fn get_server(&self, id: &str) -> Option<&Server> {
        self.doc.servers.iter().find(|s| s.id == id)
    }

    /// Looks up a server or fails with [`ControlError::ServerNotFound`].
    ///
    /// # Errors
    ///
    /// Returns an error if no server has this id.
    pub fn server(&self, id: &str) -> Result<&Server> {
        self.get_server(id)
            .ok_or_else(|| ControlError::ServerNotFound(id.to_string()))
    }

    /// Looks up a client in the global map.
    #[must_use]
    pub fn get_client(&self, id: &str) -> Option<&Client> {
        self.doc.clients.get(id)
    }

    /// Every client, ordered by id.
    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.doc.clients.values()
    }

    /// Clients owned by a server, from the global map.
    pub fn clients_of<'a>(&'a self, server_id: &'a str) -> impl Iterator<Item = &'a Client> {
        self.doc.clients.values().filter(move |c| c.server_id == server_id)
    }

    /// Inserts or replaces a server record.
    pub fn upsert_server(&mut self, server: Server) {
        match self.doc.servers.iter_mut().find(|s| s.id == server.id) {
            Some(existing) => *existing = server,
            None => self.doc.servers.push(server),
        }
        self.dirty = true;
    }

    /// Inserts or replaces a client in the global map and its server's mirror.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::ServerNotFound`] if the owning server does not
    /// exist; nothing is changed in that case.
    pub fn upsert_client(&mut self, client: Client) -> Result<()> {
        let server = self.server_mut(&client.server_id)?;
        match server.clients.iter_mut().find(|c| c.id == client.id) {
            Some(existing) => *existing = client.clone(),
            None => server.clients.push(client.clone()),
        }
        self.doc.clients.insert(client.id.clone(), client);
        self.dirty = true;
        Ok(())
    }

    /// Removes a server and every client that references it.
    ///
    /// Returns the removed server.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::ServerNotFound`] for an unknown id.
    pub fn delete_server(&mut self, id: &str) -> Result<Server> {
        let index = self
            .doc
            .servers
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| ControlError::ServerNotFound(id.to_string()))?;
        let server = self.doc.servers.remove(index);
        self.doc.clients.retain(|_, c| c.server_id != id);
        self.dirty = true;
        Ok(server)
    }

    /// Removes a client from the global map and from its server's mirror.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::ClientNotFound`] for an unknown id.
    pub fn delete_client(&mut self, id: &str) -> Result<Client> {
        let client = self
            .doc
            .clients
            .remove(id)
            .ok_or_else(|| ControlError::ClientNotFound(id.to_string()))?;
        if let Some(server) = self.doc.servers.iter_mut().find(|s| s.id == client.server_id) {
            server.clients.retain(|c| c.id != id);
        }
        self.dirty = true;
        Ok(client)
    }

    /// Applies `f` to a server record.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::ServerNotFound`] for an unknown id.
    pub fn update_server<F>(&mut self, id: &str, f: F) -> Result<Server>
    where
        F: FnOnce(&mut Server),
    {
        let server = self.server_mut(id)?;
        f(server);
        let updated = server.clone();
        self.dirty = true;
        Ok(updated)
    }

    /// Applies `f` to a client and copies the result into the server mirror.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::ClientNotFound`] for an unknown id.
    pub fn update_client<F>(&mut self, id: &str, f: F) -> Result<Client>
    where
        F: FnOnce(&mut Client),
    {
        let client = self
            .doc
            .clients
            .get_mut(id)
            .ok_or_else(|| ControlError::ClientNotFound(id.to_string()))?;
        f(client);
        let updated = client.clone();
        self.sync_mirror(&updated);
        self.dirty = true;
        Ok(updated)
    }

    /// Sets a server's cached status. Returns whether it changed.
    pub fn set_server_status(&mut self, id: &str, status: ServerStatus) -> bool {
        let Some(server) = self.doc.servers.iter_mut().find(|s| s.id == id) else {
            return false;
        };
        if server.status == status {
            return false;
        }
        server.status = status;
        self.dirty = true;
        true
    }

    /// Sets a client's derived status in both copies. Returns whether it
    /// changed.
    pub fn set_client_status(&mut self, id: &str, status: ClientStatus) -> bool {
        let Some(client) = self.doc.clients.get_mut(id) else {
            return false;
        };
        if client.status == status {
            return false;
        }
        client.status = status;
        let updated = client.clone();
        self.sync_mirror(&updated);
        self.dirty = true;
        true
    }

    /// Whether there are unsaved changes.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Flags the document as needing a write.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Writes the whole document through a temporary file and rename.
    ///
    /// On failure the previous file is left intact and the dirty flag is kept.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Persistence`] if serialization or the write fails.
    pub fn save(&mut self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.doc).map_err(|e| ControlError::Persistence {
            path: self.path.clone(),
            source: std::io::Error::other(e),
        })?;
        write_atomic(&self.path, &json).map_err(|source| ControlError::Persistence {
            path: self.path.clone(),
            source,
        })?;
        self.dirty = false;
        debug!(path = %self.path.display(), "state document saved");
        Ok(())
    }

    fn server_mut(&mut self, id: &str) -> Result<&mut Server> {
        self.doc
            .servers
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| ControlError::ServerNotFound(id.to_string()))
    }

    fn sync_mirror(&mut self, client: &Client) {
        if let Some(server) = self.doc.servers.iter_mut().find(|s| s.id == client.server_id) {
            match server.clients.iter_mut().find(|c| c.id == client.id) {
                Some(mirror) => *mirror = client.clone(),
                None => server.clients.push(client.clone()),
            }
        }
    }
}
