//! The seam between the control plane and the tunnel tooling.
//!
//! [`TunnelInterface`] covers every operation the control plane needs from
//! the outside world on a tunnel: key material, bringing an interface up or
//! down, live reload and the peer status dump. [`crate::cli::AwgCli`]
//! implements it with the `awg` tools; [`FakeTunnelInterface`] keeps
//! everything in memory for tests.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, WireGuardError};
use crate::keys::{KEY_SIZE, PresharedKey, PrivateKey, PublicKey};
use awg_exec::CommandError;

/// Operations on tunnel interfaces and their key tooling.
pub trait TunnelInterface: Send + Sync {
    /// Generates a private key, base64 encoded.
    fn genkey(&self) -> impl Future<Output = Result<String>> + Send;

    /// Derives the base64 public key for a private key.
    fn pubkey(&self, private: &PrivateKey) -> impl Future<Output = Result<String>> + Send;

    /// Generates a preshared key, base64 encoded.
    fn genpsk(&self) -> impl Future<Output = Result<String>> + Send;

    /// Brings an interface up from its configuration file.
    fn up(&self, interface: &str) -> impl Future<Output = Result<()>> + Send;

    /// Brings an interface down.
    fn down(&self, interface: &str) -> impl Future<Output = Result<()>> + Send;

    /// Applies the configuration file to a running interface without
    /// restarting it.
    fn sync(&self, interface: &str) -> impl Future<Output = Result<()>> + Send;

    /// Whether the interface currently exists and is up. Any failure to
    /// observe it reads as down.
    fn is_up(&self, interface: &str) -> impl Future<Output = bool> + Send;

    /// Raw peer status dump for an interface.
    fn show(&self, interface: &str) -> impl Future<Output = Result<String>> + Send;

    /// Whether the tooling is installed at all.
    fn tools_available(&self) -> impl Future<Output = bool> + Send;
}

#[derive(Debug, Default)]
struct FakeState {
    up: HashSet<String>,
    show_output: HashMap<String, String>,
    calls: Vec<String>,
    next_key: u8,
    last_keypair: Option<(PrivateKey, PublicKey)>,
    fail_keys: bool,
    fail_up: bool,
    fail_down: bool,
    fail_sync: bool,
    fail_show: bool,
}

/// An in-memory tunnel interface for testing.
///
/// Clones share state, so a test can keep a handle while the code under
/// test owns another.
#[derive(Debug, Clone, Default)]
pub struct FakeTunnelInterface {
    state: Arc<Mutex<FakeState>>,
}

fn fake_failure(op: &str, interface: &str) -> WireGuardError {
    WireGuardError::Command(CommandError::non_zero_exit(
        format!("fake {op} {interface}"),
        1,
        "simulated failure",
    ))
}

/// Public half the fake derives for a private key.
fn fake_public(private: &PrivateKey) -> PublicKey {
    let mut bytes = *private.as_bytes();
    for b in &mut bytes {
        *b = !*b;
    }
    PublicKey::from_bytes_array(bytes)
}

impl FakeTunnelInterface {
    /// Creates a fake with every interface down.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an interface up or down without recording a call.
    pub fn set_up(&self, interface: &str, up: bool) {
        let mut state = self.state.lock();
        if up {
            state.up.insert(interface.to_string());
        } else {
            state.up.remove(interface);
        }
    }

    /// Sets the status dump returned for an interface.
    pub fn set_show_output(&self, interface: &str, output: impl Into<String>) {
        self.state
            .lock()
            .show_output
            .insert(interface.to_string(), output.into());
    }

    /// Makes key generation fail.
    pub fn fail_key_generation(&self, fail: bool) {
        self.state.lock().fail_keys = fail;
    }

    /// Makes `up` fail.
    pub fn fail_up(&self, fail: bool) {
        self.state.lock().fail_up = fail;
    }

    /// Makes `down` fail.
    pub fn fail_down(&self, fail: bool) {
        self.state.lock().fail_down = fail;
    }

    /// Makes `sync` fail.
    pub fn fail_sync(&self, fail: bool) {
        self.state.lock().fail_sync = fail;
    }

    /// Makes `show` fail.
    pub fn fail_show(&self, fail: bool) {
        self.state.lock().fail_show = fail;
    }

    /// Every recorded call, e.g. `up wg-a1b2c3`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Number of recorded calls starting with `prefix`.
    #[must_use]
    pub fn call_count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// The last key pair produced through `genkey` + `pubkey`.
    #[must_use]
    pub fn last_generated_keypair(&self) -> Option<(PrivateKey, PublicKey)> {
        self.state.lock().last_keypair.clone()
    }

    fn record(&self, call: String) -> parking_lot::MutexGuard<'_, FakeState> {
        let mut state = self.state.lock();
        state.calls.push(call);
        state
    }
}

impl TunnelInterface for FakeTunnelInterface {
    async fn genkey(&self) -> Result<String> {
        let mut state = self.record("genkey".to_string());
        if state.fail_keys {
            return Err(fake_failure("genkey", ""));
        }
        state.next_key = state.next_key.wrapping_add(1);
        Ok(PrivateKey::from_bytes_array([state.next_key; KEY_SIZE]).to_base64())
    }

    async fn pubkey(&self, private: &PrivateKey) -> Result<String> {
        let mut state = self.record("pubkey".to_string());
        if state.fail_keys {
            return Err(fake_failure("pubkey", ""));
        }
        let public = fake_public(private);
        state.last_keypair = Some((private.clone(), public));
        Ok(format!("{}\n", public.to_base64()))
    }

    async fn genpsk(&self) -> Result<String> {
        let state = self.record("genpsk".to_string());
        if state.fail_keys {
            return Err(fake_failure("genpsk", ""));
        }
        Ok(PresharedKey::random().to_base64())
    }

    async fn up(&self, interface: &str) -> Result<()> {
        let mut state = self.record(format!("up {interface}"));
        if state.fail_up {
            return Err(fake_failure("up", interface));
        }
        state.up.insert(interface.to_string());
        Ok(())
    }

    async fn down(&self, interface: &str) -> Result<()> {
        let mut state = self.record(format!("down {interface}"));
        if state.fail_down {
            return Err(fake_failure("down", interface));
        }
        state.up.remove(interface);
        Ok(())
    }

    async fn sync(&self, interface: &str) -> Result<()> {
        let state = self.record(format!("sync {interface}"));
        if state.fail_sync {
            return Err(fake_failure("sync", interface));
        }
        Ok(())
    }

    async fn is_up(&self, interface: &str) -> bool {
        self.state.lock().up.contains(interface)
    }

    async fn show(&self, interface: &str) -> Result<String> {
        let state = self.record(format!("show {interface}"));
        if state.fail_show {
            return Err(fake_failure("show", interface));
        }
        Ok(state.show_output.get(interface).cloned().unwrap_or_default())
    }

    async fn tools_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn up_down_tracks_state() {
        let fake = FakeTunnelInterface::new();
        assert!(!fake.is_up("wg-a").await);

        fake.up("wg-a").await.expect("up");
        assert!(fake.is_up("wg-a").await);

        fake.down("wg-a").await.expect("down");
        assert!(!fake.is_up("wg-a").await);
        assert_eq!(fake.calls(), vec!["up wg-a", "down wg-a"]);
    }

    #[tokio::test]
    async fn failures_leave_state_unchanged() {
        let fake = FakeTunnelInterface::new();
        fake.fail_up(true);
        assert!(fake.up("wg-a").await.is_err());
        assert!(!fake.is_up("wg-a").await);

        fake.set_up("wg-a", true);
        fake.fail_down(true);
        assert!(fake.down("wg-a").await.is_err());
        assert!(fake.is_up("wg-a").await);
    }

    #[tokio::test]
    async fn keys_are_distinct_and_valid() {
        let fake = FakeTunnelInterface::new();
        let a = fake.genkey().await.expect("genkey");
        let b = fake.genkey().await.expect("genkey");
        assert_ne!(a, b);
        let private = PrivateKey::from_base64(&a).expect("valid key");
        let public = fake.pubkey(&private).await.expect("pubkey");
        assert!(PublicKey::from_base64(&public).is_ok());
    }

    #[tokio::test]
    async fn show_returns_configured_output() {
        let fake = FakeTunnelInterface::new();
        assert_eq!(fake.show("wg-a").await.expect("show"), "");
        fake.set_show_output("wg-a", "interface: wg-a\n");
        assert_eq!(fake.show("wg-a").await.expect("show"), "interface: wg-a\n");
        assert_eq!(fake.call_count("show"), 2);
    }
}
