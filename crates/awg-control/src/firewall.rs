//! Firewall rule scripts, treated as opaque success/failure collaborators.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use awg_exec::{AllowedProgram, CommandError, SafeCommand};
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use tracing::debug;

use crate::settings::FirewallScripts;

/// Inputs passed to the firewall scripts for one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRules {
    /// Tunnel interface name.
    pub interface: String,
    /// Tunnel subnet.
    pub subnet: Ipv4Net,
    /// Masquerade tunnel traffic.
    pub enable_nat: bool,
    /// Block LAN ranges for clients.
    pub block_lan_cidrs: bool,
}

/// Installs and removes per-interface firewall rules.
pub trait Firewall: Send + Sync {
    /// Installs rules for an interface that has just come up.
    fn setup(&self, rules: &FirewallRules)
    -> impl Future<Output = Result<(), CommandError>> + Send;

    /// Removes rules for an interface about to go down.
    fn cleanup(
        &self,
        rules: &FirewallRules,
    ) -> impl Future<Output = Result<(), CommandError>> + Send;
}

/// Runs the setup and cleanup shell scripts.
///
/// Scripts take `<interface> <subnet>` as arguments and read the two flags
/// from `ENABLE_NAT` and `BLOCK_LAN_CIDRS` (`1` or `0`).
#[derive(Debug, Clone)]
pub struct ScriptFirewall {
    scripts: FirewallScripts,
    timeout: Duration,
}

impl ScriptFirewall {
    /// Creates a firewall driver for the given scripts.
    #[must_use]
    pub fn new(scripts: FirewallScripts, timeout: Duration) -> Self {
        Self { scripts, timeout }
    }

    async fn run(
        &self,
        program: AllowedProgram,
        script: &std::path::Path,
        rules: &FirewallRules,
    ) -> Result<(), CommandError> {
        let subnet = rules.subnet.to_string();
        debug!(script = %script.display(), interface = %rules.interface, "running firewall script");
        SafeCommand::new(program)
            .with_program_path(&script.to_string_lossy())
            .env("ENABLE_NAT", flag(rules.enable_nat))
            .env("BLOCK_LAN_CIDRS", flag(rules.block_lan_cidrs))
            .arg(&rules.interface)
            .arg(&subnet)
            .timeout(self.timeout)
            .execute()
            .await?;
        Ok(())
    }
}

const fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

impl Firewall for ScriptFirewall {
    async fn setup(&self, rules: &FirewallRules) -> Result<(), CommandError> {
        self.run(AllowedProgram::FirewallSetup, &self.scripts.setup, rules)
            .await
    }

    async fn cleanup(&self, rules: &FirewallRules) -> Result<(), CommandError> {
        self.run(AllowedProgram::FirewallCleanup, &self.scripts.cleanup, rules)
            .await
    }
}

/// One recorded firewall invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallCall {
    /// `setup` was called.
    Setup(FirewallRules),
    /// `cleanup` was called.
    Cleanup(FirewallRules),
}

/// In-memory firewall that records calls and can be told to fail.
#[derive(Debug, Clone, Default)]
pub struct RecordingFirewall {
    calls: Arc<Mutex<Vec<FirewallCall>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingFirewall {
    /// Creates a firewall that succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail.
    pub fn fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    /// Calls made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<FirewallCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: FirewallCall) -> Result<(), CommandError> {
        self.calls.lock().push(call);
        if *self.fail.lock() {
            return Err(CommandError::execution_failed("firewall script failed"));
        }
        Ok(())
    }
}

impl Firewall for RecordingFirewall {
    async fn setup(&self, rules: &FirewallRules) -> Result<(), CommandError> {
        self.record(FirewallCall::Setup(rules.clone()))
    }

    async fn cleanup(&self, rules: &FirewallRules) -> Result<(), CommandError> {
        self.record(FirewallCall::Cleanup(rules.clone()))
    }
}
