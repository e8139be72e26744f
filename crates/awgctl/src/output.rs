//! Output formatting for CLI commands.
//!
//! Supports table (human-readable) and JSON output formats.

use std::io::Write;

use awg_control::{
    Client, ClientStatus, NetworkingUpdate, Server, ServerInfo, ServerStatus, ServerTraffic,
    SystemStatus,
};
use serde::Serialize;

use crate::cli::Format;

/// Output formatter that handles both table and JSON output.
#[derive(Debug, Clone, Copy)]
pub struct OutputFormat {
    format: Format,
    color: bool,
}

impl OutputFormat {
    /// Create a new output formatter. Status words are colored only when
    /// `color` is set.
    pub const fn new(format: Format, color: bool) -> Self {
        Self { format, color }
    }

    /// Write a serializable value to the output.
    pub fn write<W, T>(&self, writer: &mut W, value: &T) -> anyhow::Result<()>
    where
        W: Write,
        T: Serialize + TableDisplay + ?Sized,
    {
        match self.format {
            Format::Json => {
                serde_json::to_writer_pretty(&mut *writer, value)?;
                writeln!(writer)?;
            }
            Format::Table => value.write_table(writer, self.color)?,
        }
        Ok(())
    }
}

/// Types that can be displayed as a table.
pub trait TableDisplay {
    /// Write the value as a human-readable table.
    fn write_table<W: Write>(&self, writer: &mut W, color: bool) -> std::io::Result<()>;
}

fn paint(text: &str, code: &str, color: bool) -> String {
    if color {
        format!("\x1b[{code}m{text}\x1b[0m")
    } else {
        text.to_string()
    }
}

fn server_status(status: ServerStatus, color: bool) -> String {
    let code = match status {
        ServerStatus::Running => "32",
        ServerStatus::Stopped => "31",
    };
    // pad before painting so escape codes do not skew the columns
    paint(&format!("{:<8}", status.to_string()), code, color)
}

fn client_status(status: ClientStatus, color: bool) -> String {
    let code = match status {
        ClientStatus::Active => "32",
        ClientStatus::Inactive => "2",
    };
    paint(&format!("{:<8}", status.to_string()), code, color)
}

fn yes_no(v: bool) -> &'static str {
    if v { "yes" } else { "no" }
}

impl TableDisplay for [Server] {
    fn write_table<W: Write>(&self, writer: &mut W, color: bool) -> std::io::Result<()> {
        if self.is_empty() {
            return writeln!(writer, "No servers");
        }
        writeln!(
            writer,
            "{:<8} {:<20} {:<8} {:<6} {:<18} {:<7}",
            "ID", "NAME", "STATUS", "PORT", "SUBNET", "CLIENTS"
        )?;
        for s in self {
            writeln!(
                writer,
                "{:<8} {:<20} {} {:<6} {:<18} {:<7}",
                s.id,
                s.name,
                server_status(s.status, color),
                s.port,
                s.subnet.to_string(),
                s.clients.len()
            )?;
        }
        Ok(())
    }
}

impl TableDisplay for Server {
    fn write_table<W: Write>(&self, writer: &mut W, color: bool) -> std::io::Result<()> {
        writeln!(writer, "Server {} created", self.id)?;
        writeln!(writer, "  Name:       {}", self.name)?;
        writeln!(writer, "  Interface:  {}", self.interface)?;
        writeln!(writer, "  Status:     {}", server_status(self.status, color))?;
        writeln!(writer, "  Address:    {}/{}", self.server_ip, self.subnet.prefix_len())?;
        writeln!(writer, "  Port:       {}", self.port)?;
        writeln!(writer, "  Public key: {}", self.server_public_key)
    }
}

impl TableDisplay for ServerInfo {
    fn write_table<W: Write>(&self, writer: &mut W, color: bool) -> std::io::Result<()> {
        writeln!(writer, "Server {}", self.id)?;
        writeln!(writer, "══════════════════════════════════")?;
        writeln!(writer, "Name:         {}", self.name)?;
        writeln!(writer, "Status:       {}", server_status(self.status, color))?;
        writeln!(writer, "Interface:    {}", self.interface)?;
        writeln!(writer, "Config:       {}", self.config_path.display())?;
        writeln!(writer, "Endpoint:     {}:{}", self.public_ip, self.port)?;
        writeln!(writer, "Address:      {}/{}", self.server_ip, self.subnet.prefix_len())?;
        writeln!(writer, "MTU:          {}", self.mtu)?;
        writeln!(
            writer,
            "DNS:          {}",
            self.dns
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        )?;
        writeln!(writer, "Obfuscation:  {}", yes_no(self.obfuscation_enabled))?;
        writeln!(writer, "NAT:          {}", yes_no(self.enable_nat))?;
        writeln!(writer, "Block LAN:    {}", yes_no(self.block_lan_cidrs))?;
        writeln!(writer, "Clients:      {}", self.clients_count)?;
        writeln!(writer, "Public key:   {}", self.public_key)?;
        writeln!(writer, "Created:      {}", self.created_at.to_rfc3339())?;
        if !self.config_preview.is_empty() {
            writeln!(writer)?;
            for line in &self.config_preview {
                writeln!(writer, "  {line}")?;
            }
        }
        Ok(())
    }
}

impl TableDisplay for [Client] {
    fn write_table<W: Write>(&self, writer: &mut W, color: bool) -> std::io::Result<()> {
        if self.is_empty() {
            return writeln!(writer, "No clients");
        }
        writeln!(
            writer,
            "{:<8} {:<20} {:<8} {:<16} {:<8}",
            "ID", "NAME", "SERVER", "ADDRESS", "STATUS"
        )?;
        for c in self {
            writeln!(
                writer,
                "{:<8} {:<20} {:<8} {:<16} {}",
                c.id,
                c.name,
                c.server_id,
                c.client_ip.to_string(),
                client_status(c.status, color)
            )?;
        }
        Ok(())
    }
}

impl TableDisplay for Client {
    fn write_table<W: Write>(&self, writer: &mut W, color: bool) -> std::io::Result<()> {
        writeln!(writer, "Client {} ({})", self.id, self.name)?;
        writeln!(writer, "  Server:     {} ({})", self.server_name, self.server_id)?;
        writeln!(writer, "  Address:    {}", self.client_ip)?;
        writeln!(writer, "  Status:     {}", client_status(self.status, color))?;
        writeln!(writer, "  Public key: {}", self.client_public_key)
    }
}

impl TableDisplay for ServerTraffic {
    fn write_table<W: Write>(&self, writer: &mut W, color: bool) -> std::io::Result<()> {
        if self.is_empty() {
            return writeln!(writer, "No traffic (server stopped or no peers)");
        }
        writeln!(
            writer,
            "{:<8} {:<8} {:<14} {:<14} {:<22} {}",
            "CLIENT", "STATUS", "RECEIVED", "SENT", "ENDPOINT", "HANDSHAKE"
        )?;
        for (id, t) in self {
            let status = ClientStatus::from_active(t.active);
            let mut endpoint = t.endpoint.clone().unwrap_or_else(|| "-".to_string());
            if let Some(geo) = &t.geo {
                endpoint = format!("{endpoint} ({geo})");
            }
            writeln!(
                writer,
                "{:<8} {} {:<14} {:<14} {:<22} {}",
                id,
                client_status(status, color),
                t.received,
                t.sent,
                endpoint,
                t.latest_handshake.as_deref().unwrap_or("never")
            )?;
        }
        Ok(())
    }
}

impl TableDisplay for NetworkingUpdate {
    fn write_table<W: Write>(&self, writer: &mut W, _color: bool) -> std::io::Result<()> {
        writeln!(writer, "Server {} networking", self.server_id)?;
        writeln!(writer, "  NAT:        {}", yes_no(self.enable_nat))?;
        writeln!(writer, "  Block LAN:  {}", yes_no(self.block_lan_cidrs))?;
        writeln!(writer, "  Firewall:   {:?}", self.firewall)
    }
}

impl TableDisplay for SystemStatus {
    fn write_table<W: Write>(&self, writer: &mut W, color: bool) -> std::io::Result<()> {
        let tools = if self.awg_available {
            paint("available", "32", color)
        } else {
            paint("missing", "31", color)
        };
        writeln!(writer, "AmneziaWG Status")?;
        writeln!(writer, "══════════════════════════════════")?;
        writeln!(writer, "Tools:            {tools}")?;
        writeln!(writer, "Public IP:        {}", self.public_ip)?;
        writeln!(writer, "Auto-start:       {}", yes_no(self.auto_start_servers))?;
        writeln!(writer)?;
        writeln!(writer, "Servers")?;
        writeln!(writer, "  Total:          {}", self.total_servers)?;
        writeln!(writer, "  Running:        {}", self.active_servers)?;
        writeln!(writer, "Clients")?;
        writeln!(writer, "  Total:          {}", self.total_clients)?;
        writeln!(writer)?;
        writeln!(writer, "Defaults")?;
        writeln!(writer, "  MTU:            {}", self.defaults.mtu)?;
        writeln!(writer, "  Subnet:         {}", self.defaults.subnet)?;
        writeln!(writer, "  Port:           {}", self.defaults.port)
    }
}

/// A one-line confirmation.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    /// Always `true`; failures exit non-zero instead.
    pub success: bool,
    /// Human-readable text.
    pub message: String,
}

impl Message {
    /// A successful result with `message`.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

impl TableDisplay for Message {
    fn write_table<W: Write>(&self, writer: &mut W, _color: bool) -> std::io::Result<()> {
        writeln!(writer, "{}", self.message)
    }
}
