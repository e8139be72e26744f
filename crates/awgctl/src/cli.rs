//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// AmneziaWG tunnel manager.
#[derive(Parser, Debug, Clone)]
#[command(name = "awgctl")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Settings file (TOML). Built-in defaults are used when absent.
    #[arg(short, long, env = "AWGCTL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    pub format: Format,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON output for scripting.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the daemon: auto-start servers and reconcile traffic until
    /// interrupted.
    Run,

    /// Show system status.
    Status,

    /// Set the endpoint host written into client configs.
    SetPublicIp {
        /// IP address or host name.
        ip: String,
    },

    /// Server management commands.
    Server {
        /// Server subcommand to execute.
        #[command(subcommand)]
        command: ServerCommands,
    },

    /// Client management commands.
    Client {
        /// Client subcommand to execute.
        #[command(subcommand)]
        command: ClientCommands,
    },
}

/// Server subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum ServerCommands {
    /// Create a server.
    Create(CreateArgs),

    /// List all servers.
    List,

    /// Show detailed information about a server.
    Info {
        /// Server ID.
        id: String,
    },

    /// Print a server's configuration file.
    Config {
        /// Server ID.
        id: String,
    },

    /// Show live per-client traffic.
    Traffic {
        /// Server ID.
        id: String,
    },

    /// Bring a server's interface up.
    Start {
        /// Server ID.
        id: String,
    },

    /// Bring a server's interface down.
    Stop {
        /// Server ID.
        id: String,
    },

    /// Delete a server and all of its clients.
    Delete {
        /// Server ID.
        id: String,
    },

    /// Change NAT and LAN-blocking flags.
    Networking {
        /// Server ID.
        id: String,

        /// Masquerade tunnel traffic.
        #[arg(long)]
        nat: Option<bool>,

        /// Block clients from private LAN ranges.
        #[arg(long)]
        block_lan: Option<bool>,
    },

    /// Replace the server's signature packets for future clients.
    IParams {
        /// Server ID.
        id: String,

        #[command(flatten)]
        values: IParamsArgs,
    },
}

/// Client subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum ClientCommands {
    /// Add a client to a server.
    Add {
        /// Server ID.
        server: String,

        /// Client name.
        name: String,

        #[command(flatten)]
        values: IParamsArgs,
    },

    /// List clients.
    List {
        /// Only clients of this server.
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Delete a client.
    Delete {
        /// Server ID.
        server: String,

        /// Client ID.
        id: String,
    },

    /// Export a client's configuration file.
    Config {
        /// Server ID.
        server: String,

        /// Client ID.
        id: String,

        /// Omit the descriptive header comments.
        #[arg(long)]
        clean: bool,

        /// Write to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Replace a client's own signature packets.
    IParams {
        /// Server ID.
        server: String,

        /// Client ID.
        id: String,

        #[command(flatten)]
        values: IParamsArgs,
    },
}

/// Arguments for `server create`. Unset values take the configured defaults.
#[derive(Args, Debug, Clone, Default)]
pub struct CreateArgs {
    /// Display name.
    #[arg(short, long)]
    pub name: Option<String>,

    /// UDP listen port.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Tunnel subnet (CIDR, or a bare address for /24).
    #[arg(short, long)]
    pub subnet: Option<String>,

    /// Interface MTU.
    #[arg(long)]
    pub mtu: Option<u16>,

    /// DNS servers (comma-separated).
    #[arg(long, value_delimiter = ',')]
    pub dns: Vec<String>,

    /// Generate obfuscation parameters.
    #[arg(long)]
    pub obfuscation: Option<bool>,

    /// Start now and on daemon startup.
    #[arg(long)]
    pub auto_start: Option<bool>,

    /// Masquerade tunnel traffic.
    #[arg(long)]
    pub nat: Option<bool>,

    /// Block clients from private LAN ranges.
    #[arg(long)]
    pub block_lan: Option<bool>,
}

/// `I1`..`I5` values.
#[derive(Args, Debug, Clone, Default)]
pub struct IParamsArgs {
    /// New I1.
    #[arg(long)]
    pub i1: Option<String>,
    /// New I2.
    #[arg(long)]
    pub i2: Option<String>,
    /// New I3.
    #[arg(long)]
    pub i3: Option<String>,
    /// New I4.
    #[arg(long)]
    pub i4: Option<String>,
    /// New I5.
    #[arg(long)]
    pub i5: Option<String>,
}

impl IParamsArgs {
    /// Whether any value was given.
    pub const fn is_empty(&self) -> bool {
        self.i1.is_none()
            && self.i2.is_none()
            && self.i3.is_none()
            && self.i4.is_none()
            && self.i5.is_none()
    }
}
