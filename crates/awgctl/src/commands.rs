//! One-shot management commands against a [`Controller`].

use std::io::Write;

use anyhow::Context;
use awg_control::{Controller, CreateServer, Firewall};
use awg_wireguard::{IParamsUpdate, TunnelInterface};
use tracing::info;

use crate::cli::{ClientCommands, CreateArgs, IParamsArgs, ServerCommands};
use crate::output::{Message, OutputFormat};

impl From<CreateArgs> for CreateServer {
    fn from(args: CreateArgs) -> Self {
        Self {
            name: args.name,
            port: args.port,
            subnet: args.subnet,
            mtu: args.mtu,
            dns: (!args.dns.is_empty()).then_some(args.dns),
            obfuscation: args.obfuscation,
            obfuscation_params: None,
            auto_start: args.auto_start,
            enable_nat: args.nat,
            block_lan_cidrs: args.block_lan,
        }
    }
}

impl From<IParamsArgs> for IParamsUpdate {
    fn from(args: IParamsArgs) -> Self {
        Self {
            i1: args.i1,
            i2: args.i2,
            i3: args.i3,
            i4: args.i4,
            i5: args.i5,
        }
    }
}

/// Runs a `server` subcommand.
pub async fn server<I, F, W>(
    controller: &Controller<I, F>,
    command: ServerCommands,
    out: &mut W,
    format: &OutputFormat,
) -> anyhow::Result<()>
where
    I: TunnelInterface + Clone + 'static,
    F: Firewall,
    W: Write,
{
    match command {
        ServerCommands::Create(args) => {
            let server = controller.create_server(args.into()).await?;
            info!(server_id = %server.id, "server created");
            format.write(out, &server)?;
        }
        ServerCommands::List => {
            let servers = controller.list_servers().await;
            format.write(out, servers.as_slice())?;
        }
        ServerCommands::Info { id } => {
            format.write(out, &controller.server_info(&id).await?)?;
        }
        ServerCommands::Config { id } => {
            let file = controller.server_config(&id).await?;
            out.write_all(file.config_content.as_bytes())?;
        }
        ServerCommands::Traffic { id } => {
            format.write(out, &controller.server_traffic(&id).await?)?;
        }
        ServerCommands::Start { id } => {
            let status = controller.start_server(&id).await?;
            format.write(out, &Message::ok(format!("server {id} {status}")))?;
        }
        ServerCommands::Stop { id } => {
            let status = controller.stop_server(&id).await?;
            format.write(out, &Message::ok(format!("server {id} {status}")))?;
        }
        ServerCommands::Delete { id } => {
            let server = controller.delete_server(&id).await?;
            format.write(
                out,
                &Message::ok(format!(
                    "server {} deleted with {} client(s)",
                    server.id,
                    server.clients.len()
                )),
            )?;
        }
        ServerCommands::Networking { id, nat, block_lan } => {
            let update = controller.update_networking(&id, nat, block_lan).await?;
            format.write(out, &update)?;
        }
        ServerCommands::IParams { id, values } => {
            anyhow::ensure!(!values.is_empty(), "no I-params given");
            controller.update_server_i_params(&id, &values.into()).await?;
            format.write(out, &Message::ok(format!("server {id} I-params updated")))?;
        }
    }
    Ok(())
}

/// Runs a `client` subcommand.
pub async fn client<I, F, W>(
    controller: &Controller<I, F>,
    command: ClientCommands,
    out: &mut W,
    format: &OutputFormat,
) -> anyhow::Result<()>
where
    I: TunnelInterface + Clone + 'static,
    F: Firewall,
    W: Write,
{
    match command {
        ClientCommands::Add {
            server,
            name,
            values,
        } => {
            let update: Option<IParamsUpdate> = (!values.is_empty()).then(|| values.into());
            let client = controller.add_client(&server, &name, update.as_ref()).await?;
            format.write(out, &client)?;
        }
        ClientCommands::List { server } => {
            let clients = controller.list_clients(server.as_deref()).await;
            format.write(out, clients.as_slice())?;
        }
        ClientCommands::Delete { server, id } => {
            let client = controller.delete_client(&server, &id).await?;
            format.write(out, &Message::ok(format!("client {} deleted", client.name)))?;
        }
        ClientCommands::Config {
            server,
            id,
            clean,
            output,
        } => {
            let file = controller.client_config(&server, &id, !clean).await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &file.content)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    format.write(
                        out,
                        &Message::ok(format!("wrote {} to {}", file.filename, path.display())),
                    )?;
                }
                None => out.write_all(file.content.as_bytes())?,
            }
        }
        ClientCommands::IParams { server, id, values } => {
            anyhow::ensure!(!values.is_empty(), "no I-params given");
            controller
                .update_client_i_params(&server, &id, &values.into())
                .await?;
            format.write(out, &Message::ok(format!("client {id} I-params updated")))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Format;
    use awg_control::{RecordingFirewall, Settings};
    use awg_wireguard::FakeTunnelInterface;

    fn controller(dir: &std::path::Path) -> Controller<FakeTunnelInterface, RecordingFirewall> {
        let mut settings = Settings::rooted_at(dir);
        settings.enable_geoip = false;
        Controller::init(settings, FakeTunnelInterface::new(), RecordingFirewall::new())
            .expect("init")
    }

    fn json() -> OutputFormat {
        OutputFormat::new(Format::Json, false)
    }

    #[test]
    fn create_args_keep_defaults_when_unset() {
        let request: CreateServer = CreateArgs::default().into();
        assert!(request.name.is_none());
        assert!(request.dns.is_none());
        assert!(request.obfuscation_params.is_none());
    }

    #[tokio::test]
    async fn server_create_then_list() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = controller(dir.path());
        let mut out = Vec::new();

        let args = CreateArgs {
            name: Some("Main".to_string()),
            auto_start: Some(false),
            ..CreateArgs::default()
        };
        server(&controller, ServerCommands::Create(args), &mut out, &json())
            .await
            .expect("create");
        out.clear();

        server(&controller, ServerCommands::List, &mut out, &json())
            .await
            .expect("list");
        let listed: serde_json::Value = serde_json::from_slice(&out).expect("json");
        assert_eq!(listed.as_array().map(Vec::len), Some(1));
        assert_eq!(listed[0]["name"], "Main");
    }

    #[tokio::test]
    async fn client_config_goes_to_stdout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = controller(dir.path());
        let created = controller
            .create_server(CreateServer {
                auto_start: Some(false),
                ..CreateServer::default()
            })
            .await
            .expect("create");
        let alice = controller
            .add_client(&created.id, "alice", None)
            .await
            .expect("alice");

        let mut out = Vec::new();
        let command = ClientCommands::Config {
            server: created.id.clone(),
            id: alice.id.clone(),
            clean: true,
            output: None,
        };
        client(&controller, command, &mut out, &json())
            .await
            .expect("config");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("[Interface]"));
    }

    #[tokio::test]
    async fn empty_i_params_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = controller(dir.path());
        let mut out = Vec::new();
        let command = ServerCommands::IParams {
            id: "abc123".to_string(),
            values: IParamsArgs::default(),
        };
        let err = server(&controller, command, &mut out, &json())
            .await
            .expect_err("no values");
        assert!(err.to_string().contains("no I-params"));
    }
}
