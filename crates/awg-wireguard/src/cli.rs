//! [`TunnelInterface`] backed by the `awg`, `awg-quick` and `ip` tools.

use std::io::Write;
use std::time::Duration;

use awg_exec::{AllowedProgram, SafeCommand};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::interface::TunnelInterface;
use crate::keys::PrivateKey;

/// Locations of the external tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    /// `awg` binary.
    pub awg: String,
    /// `awg-quick` script.
    pub awg_quick: String,
    /// iproute2 `ip` binary.
    pub ip: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            awg: "/usr/bin/awg".to_string(),
            awg_quick: "/usr/bin/awg-quick".to_string(),
            ip: "ip".to_string(),
        }
    }
}

/// Drives tunnels through the installed command-line tools.
#[derive(Debug, Clone)]
pub struct AwgCli {
    paths: ToolPaths,
    timeout: Duration,
}

impl AwgCli {
    /// Creates a driver with the given tool locations and per-command
    /// timeout.
    #[must_use]
    pub fn new(paths: ToolPaths, timeout: Duration) -> Self {
        Self { paths, timeout }
    }

    fn awg(&self) -> SafeCommand {
        SafeCommand::new(AllowedProgram::Awg)
            .with_program_path(&self.paths.awg)
            .timeout(self.timeout)
    }

    fn awg_quick(&self) -> SafeCommand {
        SafeCommand::new(AllowedProgram::AwgQuick)
            .with_program_path(&self.paths.awg_quick)
            .timeout(self.timeout)
    }

    fn ip(&self) -> SafeCommand {
        SafeCommand::new(AllowedProgram::Ip)
            .with_program_path(&self.paths.ip)
            .timeout(self.timeout)
    }
}

impl Default for AwgCli {
    fn default() -> Self {
        Self::new(ToolPaths::default(), awg_exec::command::DEFAULT_TIMEOUT)
    }
}

/// Whether `ip link show` output describes an interface that is up.
/// Point-to-point tunnels report `state UNKNOWN` while running.
fn link_is_up(output: &str) -> bool {
    output.contains("state UNKNOWN") || output.contains("state UP")
}

impl TunnelInterface for AwgCli {
    async fn genkey(&self) -> Result<String> {
        let out = self.awg().arg("genkey").execute().await?;
        Ok(out.stdout_lossy().trim().to_string())
    }

    async fn pubkey(&self, private: &PrivateKey) -> Result<String> {
        let out = self
            .awg()
            .arg("pubkey")
            .stdin(format!("{}\n", private.to_base64()))
            .execute()
            .await?;
        Ok(out.stdout_lossy().trim().to_string())
    }

    async fn genpsk(&self) -> Result<String> {
        let out = self.awg().arg("genpsk").execute().await?;
        Ok(out.stdout_lossy().trim().to_string())
    }

    async fn up(&self, interface: &str) -> Result<()> {
        self.awg_quick().arg("up").arg(interface).execute().await?;
        Ok(())
    }

    async fn down(&self, interface: &str) -> Result<()> {
        self.awg_quick().arg("down").arg(interface).execute().await?;
        Ok(())
    }

    async fn sync(&self, interface: &str) -> Result<()> {
        let stripped = self
            .awg_quick()
            .arg("strip")
            .arg(interface)
            .execute()
            .await?;

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&stripped.stdout)?;
        file.flush()?;

        let path = file.path().to_string_lossy().into_owned();
        self.awg()
            .arg("syncconf")
            .arg(interface)
            .arg(&path)
            .execute()
            .await?;
        debug!(interface, "live configuration applied");
        Ok(())
    }

    async fn is_up(&self, interface: &str) -> bool {
        match self.ip().args(["link", "show", interface]).execute().await {
            Ok(out) => link_is_up(&out.stdout_lossy()),
            Err(e) => {
                debug!(interface, error = %e, "link not observable");
                false
            }
        }
    }

    async fn show(&self, interface: &str) -> Result<String> {
        let out = self.awg().arg("show").arg(interface).execute().await?;
        Ok(out.stdout_lossy())
    }

    async fn tools_available(&self) -> bool {
        let awg = self.awg().arg("--version").execute().await.is_ok();
        awg && std::path::Path::new(&self.paths.awg_quick).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("4: wg-a1b2c3: <POINTOPOINT,NOARP,UP,LOWER_UP> mtu 1420 qdisc noqueue state UNKNOWN mode DEFAULT", true ; "tunnel running")]
    #[test_case("2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 state UP mode DEFAULT", true ; "regular up")]
    #[test_case("4: wg-a1b2c3: <POINTOPOINT,NOARP> mtu 1420 state DOWN", false ; "down")]
    #[test_case("", false ; "no output")]
    fn link_state(output: &str, expected: bool) {
        assert_eq!(link_is_up(output), expected);
    }

    #[tokio::test]
    async fn missing_tools_read_as_down_and_unavailable() {
        let cli = AwgCli::new(
            ToolPaths {
                awg: "/nonexistent/awg".to_string(),
                awg_quick: "/nonexistent/awg-quick".to_string(),
                ip: "/nonexistent/ip".to_string(),
            },
            Duration::from_secs(2),
        );
        assert!(!cli.is_up("wg-a1b2c3").await);
        assert!(!cli.tools_available().await);
        assert!(cli.genkey().await.is_err());
    }
}
