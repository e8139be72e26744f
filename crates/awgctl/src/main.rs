//! awgctl - AmneziaWG tunnel daemon and management CLI.
//!
//! `awgctl run` keeps the tunnels reconciled until interrupted; every other
//! subcommand performs one operation against the same state document.

mod cli;
mod commands;
mod output;

use std::io::{self, IsTerminal};

use anyhow::Context;
use awg_control::{ControlEvent, Controller, ScriptFirewall, Settings};
use awg_wireguard::AwgCli;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::cli::{Cli, Commands};
use crate::output::{Message, OutputFormat};

type LiveController = Controller<AwgCli, ScriptFirewall>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(
            EnvFilter::from_default_env()
                .add_directive("awgctl=info".parse()?)
                .add_directive("awg_control=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    let tunnel = AwgCli::new(settings.tools.clone(), settings.command_timeout());
    let firewall = ScriptFirewall::new(settings.firewall.clone(), settings.command_timeout());
    let controller = Controller::init(settings, tunnel, firewall)?;

    let format = OutputFormat::new(cli.format, io::stdout().is_terminal());
    let mut stdout = io::stdout().lock();

    match cli.command {
        Commands::Run => {
            drop(stdout);
            run_daemon(&controller).await?;
        }
        Commands::Status => {
            format.write(&mut stdout, &controller.system_status().await)?;
        }
        Commands::SetPublicIp { ip } => {
            controller.set_public_ip(&ip).await?;
            format.write(&mut stdout, &Message::ok(format!("public IP set to {ip}")))?;
        }
        Commands::Server { command } => {
            commands::server(&controller, command, &mut stdout, &format).await?;
        }
        Commands::Client { command } => {
            commands::client(&controller, command, &mut stdout, &format).await?;
        }
    }

    controller.shutdown().await?;
    Ok(())
}

fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::default(),
    };
    settings.apply_process_env()?;
    settings.validate()?;
    Ok(settings)
}

async fn run_daemon(controller: &LiveController) -> anyhow::Result<()> {
    let settings = controller.settings();
    info!(
        state_file = %settings.state_file.display(),
        tunnel_dir = %settings.tunnel_dir.display(),
        public_ip = %controller.public_ip(),
        "starting awgctl daemon"
    );

    let started = controller.auto_start_servers().await;
    info!(started = started.len(), "auto-start complete");

    let cancel = CancellationToken::new();
    let reconciler = tokio::spawn(
        controller
            .reconciler()
            .run(settings.poll_interval(), cancel.clone()),
    );
    let events = tokio::spawn(log_events(controller.subscribe(), cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    cancel.cancel();

    if let Err(e) = reconciler.await {
        warn!(error = %e, "reconciler task ended abnormally");
    }
    if let Err(e) = events.await {
        warn!(error = %e, "event task ended abnormally");
    }
    info!("awgctl daemon stopped");
    Ok(())
}

async fn log_events(
    mut events: tokio::sync::broadcast::Receiver<ControlEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(ControlEvent::ServerStatus { server_id, status }) => {
                    info!(server_id = %server_id, %status, "server status changed");
                }
                Ok(ControlEvent::TrafficUpdate { server_id, traffic }) => {
                    let active = traffic.values().filter(|t| t.active).count();
                    debug!(server_id = %server_id, clients = traffic.len(), active, "traffic update");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event log lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{ClientCommands, Format, ServerCommands};

    #[test]
    fn cli_parses_status() {
        let cli = Cli::parse_from(["awgctl", "status"]);
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn cli_respects_format_flag() {
        let cli = Cli::parse_from(["awgctl", "--format", "json", "server", "list"]);
        assert_eq!(cli.format, Format::Json);
        assert!(matches!(
            cli.command,
            Commands::Server {
                command: ServerCommands::List
            }
        ));
    }

    #[test]
    fn cli_parses_server_create() {
        let cli = Cli::parse_from([
            "awgctl",
            "server",
            "create",
            "--name",
            "Edge",
            "--subnet",
            "10.8.0.0/24",
            "--mtu",
            "1400",
            "--dns",
            "1.1.1.1,9.9.9.9",
            "--obfuscation",
            "true",
        ]);
        match cli.command {
            Commands::Server {
                command: ServerCommands::Create(args),
            } => {
                assert_eq!(args.name.as_deref(), Some("Edge"));
                assert_eq!(args.mtu, Some(1400));
                assert_eq!(args.dns, vec!["1.1.1.1", "9.9.9.9"]);
                assert_eq!(args.obfuscation, Some(true));
                assert!(args.auto_start.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_parses_client_config_output() {
        let cli = Cli::parse_from([
            "awgctl", "client", "config", "a1b2c3", "d4e5f6", "--clean", "-o", "alice.conf",
        ]);
        match cli.command {
            Commands::Client {
                command:
                    ClientCommands::Config {
                        server,
                        id,
                        clean,
                        output,
                    },
            } => {
                assert_eq!(server, "a1b2c3");
                assert_eq!(id, "d4e5f6");
                assert!(clean);
                assert_eq!(output.as_deref(), Some(std::path::Path::new("alice.conf")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_parses_networking_flags() {
        let cli = Cli::parse_from([
            "awgctl", "server", "networking", "a1b2c3", "--nat", "false",
        ]);
        match cli.command {
            Commands::Server {
                command: ServerCommands::Networking { id, nat, block_lan },
            } => {
                assert_eq!(id, "a1b2c3");
                assert_eq!(nat, Some(false));
                assert!(block_lan.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn load_settings_reads_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("awgctl.toml");
        std::fs::write(&path, "public_ip = \"203.0.113.7\"\npoll_interval_secs = 15\n")
            .expect("write");

        let cli = Cli::parse_from(["awgctl", "--config", path.to_str().expect("path"), "status"]);
        let settings = load_settings(&cli).expect("settings");
        assert_eq!(settings.poll_interval_secs, 15);
    }
}
