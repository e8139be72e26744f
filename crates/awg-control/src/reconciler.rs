//! Periodic traffic reconciliation.
//!
//! Each sweep polls the status dump of every running server, maps peers to
//! clients by public key, writes the derived client status back through the
//! store and publishes the traffic figures. Status-only changes are
//! persisted at most once per throttle interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use awg_wireguard::{PeerStats, PublicKey, TunnelInterface, endpoint_ip, is_active, parse_show};
use tokio::sync::{RwLock, broadcast};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{ClientTraffic, ControlEvent, ServerTraffic};
use crate::geoip::{GeoLocation, GeoLocator};
use crate::model::ClientStatus;
use crate::store::EntityStore;

/// Limits how often reconciler-driven changes are written.
#[derive(Debug, Clone)]
pub struct PersistThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl PersistThrottle {
    /// A throttle allowing one write per `interval`; the first write is
    /// allowed immediately.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Whether a write is allowed at `now`.
    #[must_use]
    pub fn ready(&self, now: Instant) -> bool {
        self.last
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval)
    }

    /// Records a successful write at `now`.
    pub fn record(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

/// Polls running servers and folds peer statistics into client status.
pub struct TrafficReconciler<I> {
    store: Arc<RwLock<EntityStore>>,
    tunnel: I,
    geo: Arc<GeoLocator>,
    events: broadcast::Sender<ControlEvent>,
    throttle: Arc<parking_lot::Mutex<PersistThrottle>>,
}

impl<I: TunnelInterface> TrafficReconciler<I> {
    pub(crate) fn new(
        store: Arc<RwLock<EntityStore>>,
        tunnel: I,
        geo: Arc<GeoLocator>,
        events: broadcast::Sender<ControlEvent>,
        throttle: Arc<parking_lot::Mutex<PersistThrottle>>,
    ) -> Self {
        Self {
            store,
            tunnel,
            geo,
            events,
            throttle,
        }
    }

    /// Reads one server's status dump and updates its clients' status.
    ///
    /// The store lock is not held while the dump command runs. Empty output
    /// yields an empty map and leaves every status untouched.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown server, a failed dump command or
    /// output that is not a status dump.
    pub async fn reconcile_server(&self, server_id: &str) -> Result<ServerTraffic> {
        let (interface, clients): (String, Vec<(String, PublicKey)>) = {
            let store = self.store.read().await;
            let server = store.server(server_id)?;
            let clients = store
                .clients_of(server_id)
                .map(|c| (c.id.clone(), c.client_public_key))
                .collect();
            (server.interface.clone(), clients)
        };

        let output = self.tunnel.show(&interface).await?;
        if output.trim().is_empty() {
            debug!(server_id, "empty status dump");
            return Ok(ServerTraffic::new());
        }
        let peers = parse_show(&interface, &output)?;

        let mut traffic = ServerTraffic::new();
        let mut statuses = Vec::with_capacity(clients.len());
        for (client_id, public_key) in clients {
            let stats = peers.get(&public_key.to_base64());
            let entry = self.client_traffic(stats).await;
            statuses.push((client_id.clone(), ClientStatus::from_active(entry.active)));
            traffic.insert(client_id, entry);
        }

        let mut store = self.store.write().await;
        let mut changed = 0;
        for (id, status) in &statuses {
            if store.set_client_status(id, *status) {
                changed += 1;
            }
        }
        if changed > 0 {
            debug!(server_id, changed, "client status changed");
        }
        Ok(traffic)
    }

    async fn client_traffic(&self, stats: Option<&PeerStats>) -> ClientTraffic {
        let Some(stats) = stats else {
            return ClientTraffic::default();
        };
        let latest_handshake_seconds = stats.handshake_seconds();
        let geo = match stats.endpoint.as_deref().and_then(endpoint_ip) {
            Some(ip) => self.geo.locate(ip).await,
            None => GeoLocation::default(),
        };
        let volume = |v: &Option<String>| {
            v.clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "0 B".to_string())
        };

        ClientTraffic {
            received: volume(&stats.received),
            sent: volume(&stats.sent),
            endpoint: stats.endpoint.clone(),
            geo: geo.label,
            geo_country_code: geo.country_code,
            latest_handshake: stats.latest_handshake.clone(),
            latest_handshake_seconds,
            active: is_active(latest_handshake_seconds),
        }
    }

    /// Runs one sweep now. Returns the number of servers polled.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Instant::now()).await
    }

    /// Runs one sweep, using `now` for the persistence throttle.
    ///
    /// A failing server is logged and skipped; the sweep continues with the
    /// rest.
    pub async fn sweep_at(&self, now: Instant) -> usize {
        let servers: Vec<(String, String)> = {
            let store = self.store.read().await;
            store
                .servers()
                .iter()
                .map(|s| (s.id.clone(), s.interface.clone()))
                .collect()
        };

        let mut polled = 0;
        for (server_id, interface) in servers {
            if !self.tunnel.is_up(&interface).await {
                continue;
            }
            polled += 1;
            match self.reconcile_server(&server_id).await {
                Ok(traffic) if !traffic.is_empty() => {
                    let _ = self.events.send(ControlEvent::TrafficUpdate {
                        server_id,
                        traffic,
                    });
                }
                Ok(_) => {}
                Err(e) => warn!(server_id = %server_id, error = %e, "traffic poll failed"),
            }
        }

        self.persist_if_due(now).await;
        polled
    }

    /// Saves a dirty document if the throttle allows it at `now`.
    ///
    /// Returns whether a write happened. A failed write is logged and the
    /// document stays dirty for the next attempt.
    pub async fn persist_if_due(&self, now: Instant) -> bool {
        let mut store = self.store.write().await;
        if !store.is_dirty() || !self.throttle.lock().ready(now) {
            return false;
        }
        match store.save() {
            Ok(()) => {
                self.throttle.lock().record(now);
                debug!("persisted client status changes");
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to persist client status changes");
                false
            }
        }
    }

    /// Sweeps every `interval` until `cancel` fires.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "traffic reconciler started");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
        info!("traffic reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_first_write_immediate() {
        let throttle = PersistThrottle::new(Duration::from_secs(60));
        assert!(throttle.ready(Instant::now()));
    }

    #[test]
    fn test_throttle_window() {
        let start = Instant::now();
        let mut throttle = PersistThrottle::new(Duration::from_secs(60));
        throttle.record(start);

        assert!(!throttle.ready(start + Duration::from_secs(7)));
        assert!(!throttle.ready(start + Duration::from_secs(59)));
        assert!(throttle.ready(start + Duration::from_secs(60)));
    }

    #[test]
    fn test_throttle_tolerates_earlier_instant() {
        let start = Instant::now();
        let mut throttle = PersistThrottle::new(Duration::from_secs(60));
        throttle.record(start + Duration::from_secs(10));
        assert!(!throttle.ready(start));
    }
}
