//! Tunnel configuration files.
//!
//! A server file is an `[Interface]` header followed by peer blocks, each
//! introduced by a `# Client: <name>` marker line. [`ServerConf`] keeps the
//! file as raw lines grouped into those blocks so that editing one peer never
//! touches the bytes of any other.

use std::fmt::Write as FmtWrite;
use std::io::Write as IoWrite;
use std::net::Ipv4Addr;
use std::path::Path;

use chrono::{DateTime, Local};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Result;
use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use crate::obfuscation::ObfuscationParams;

/// Prefix of every peer marker line.
pub const MARKER_PREFIX: &str = "# Client:";

/// The marker line that introduces a client's peer block.
#[must_use]
pub fn marker(client_name: &str) -> String {
    format!("{MARKER_PREFIX} {client_name}")
}

fn is_marker_line(line: &str) -> bool {
    line.trim_start().starts_with(MARKER_PREFIX)
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

/// One marker-delimited peer block, raw lines with their terminators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerBlock {
    lines: Vec<String>,
}

impl PeerBlock {
    /// The exact marker line, without surrounding whitespace.
    #[must_use]
    pub fn marker_line(&self) -> &str {
        self.lines.first().map_or("", |l| l.trim())
    }

    /// The client name carried by the marker.
    #[must_use]
    pub fn client_name(&self) -> &str {
        self.marker_line()
            .strip_prefix(MARKER_PREFIX)
            .unwrap_or_default()
            .trim()
    }

    fn is_for(&self, client_name: &str) -> bool {
        self.marker_line() == marker(client_name)
    }
}

/// A server configuration file split into its header and peer blocks.
///
/// `ServerConf::parse(text).to_string() == text` for any input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerConf {
    header: Vec<String>,
    peers: Vec<PeerBlock>,
}

impl ServerConf {
    /// Splits file text into header and peer blocks.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut conf = Self::default();
        for line in text.split_inclusive('\n') {
            if is_marker_line(line) {
                conf.peers.push(PeerBlock {
                    lines: vec![line.to_string()],
                });
            } else {
                conf.tail_mut().push(line.to_string());
            }
        }
        conf
    }

    /// Reads and parses a file; a missing file reads as empty.
    ///
    /// # Errors
    ///
    /// Returns an I/O error for anything other than a missing file.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replaces the file at `path` with this configuration.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, self.to_string().as_bytes())?;
        Ok(())
    }

    /// Peer blocks in file order.
    #[must_use]
    pub fn peers(&self) -> &[PeerBlock] {
        &self.peers
    }

    /// Whether a peer block with this client's marker exists.
    #[must_use]
    pub fn contains_peer(&self, client_name: &str) -> bool {
        self.peers.iter().any(|p| p.is_for(client_name))
    }

    /// Appends a marker and `[Peer]` stanza for a client.
    ///
    /// A missing final newline is added first; a blank line separates the
    /// new block from whatever precedes it.
    pub fn append_peer(
        &mut self,
        client_name: &str,
        public_key: &PublicKey,
        preshared_key: &PresharedKey,
        client_ip: Ipv4Addr,
    ) {
        let tail = self.tail_mut();
        if let Some(last) = tail.last_mut() {
            if !last.ends_with('\n') {
                last.push('\n');
            }
        }
        tail.push("\n".to_string());

        self.peers.push(PeerBlock {
            lines: vec![
                format!("{}\n", marker(client_name)),
                "[Peer]\n".to_string(),
                format!("PublicKey = {public_key}\n"),
                format!("PresharedKey = {}\n", preshared_key.to_base64()),
                format!("AllowedIPs = {client_ip}/32\n"),
            ],
        });
    }

    /// Removes the first peer block whose marker is exactly this client's,
    /// then trims trailing blank lines from the file.
    ///
    /// Returns `false` if no block matched.
    pub fn remove_peer(&mut self, client_name: &str) -> bool {
        let Some(index) = self.peers.iter().position(|p| p.is_for(client_name)) else {
            return false;
        };
        self.peers.remove(index);

        let tail = self.tail_mut();
        while tail.last().is_some_and(|l| is_blank(l)) {
            tail.pop();
        }
        true
    }

    /// First `n` lines of the file, without terminators.
    #[must_use]
    pub fn preview(&self, n: usize) -> Vec<String> {
        self.header
            .iter()
            .chain(self.peers.iter().flat_map(|p| p.lines.iter()))
            .take(n)
            .map(|l| l.trim_end_matches(['\n', '\r']).to_string())
            .collect()
    }

    fn tail_mut(&mut self) -> &mut Vec<String> {
        match self.peers.last_mut() {
            Some(peer) => &mut peer.lines,
            None => &mut self.header,
        }
    }
}

impl std::fmt::Display for ServerConf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for line in self
            .header
            .iter()
            .chain(self.peers.iter().flat_map(|p| p.lines.iter()))
        {
            f.write_str(line)?;
        }
        Ok(())
    }
}

/// Values rendered into a server's `[Interface]` block.
#[derive(Debug, Clone)]
pub struct ServerInterface<'a> {
    /// Server private key.
    pub private_key: &'a PrivateKey,
    /// Server tunnel address.
    pub address: Ipv4Addr,
    /// Subnet prefix length.
    pub prefix_len: u8,
    /// UDP listen port.
    pub listen_port: u16,
    /// Interface MTU.
    pub mtu: u16,
    /// Obfuscation scalars, when enabled.
    pub obfuscation: Option<&'a ObfuscationParams>,
}

/// Renders the initial contents of a server configuration file.
#[must_use]
pub fn render_server_interface(iface: &ServerInterface<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "PrivateKey = {}", iface.private_key.to_base64());
    let _ = writeln!(out, "Address = {}/{}", iface.address, iface.prefix_len);
    let _ = writeln!(out, "ListenPort = {}", iface.listen_port);
    let _ = writeln!(out, "SaveConfig = false");
    let _ = writeln!(out, "MTU = {}", iface.mtu);
    if let Some(params) = iface.obfuscation {
        for line in params.scalar_lines() {
            let _ = writeln!(out, "{line}");
        }
    }
    out
}

/// Everything needed to render a client's own configuration file.
#[derive(Debug, Clone)]
pub struct ClientExport<'a> {
    /// Server display name.
    pub server_name: &'a str,
    /// Client display name.
    pub client_name: &'a str,
    /// Host clients dial.
    pub endpoint_host: &'a str,
    /// Server listen port.
    pub port: u16,
    /// Client private key.
    pub private_key: &'a PrivateKey,
    /// Client tunnel address.
    pub client_ip: Ipv4Addr,
    /// DNS servers pushed to the client.
    pub dns: &'a [Ipv4Addr],
    /// Tunnel MTU.
    pub mtu: u16,
    /// Client obfuscation parameters, when enabled.
    pub obfuscation: Option<&'a ObfuscationParams>,
    /// Server public key.
    pub server_public_key: &'a PublicKey,
    /// Preshared key shared with the server.
    pub preshared_key: &'a PresharedKey,
    /// Timestamp for the descriptive header.
    pub generated_at: DateTime<Local>,
}

/// Renders a client configuration, optionally with a descriptive header.
#[must_use]
pub fn render_client_config(export: &ClientExport<'_>, include_comments: bool) -> String {
    let mut out = String::new();
    if include_comments {
        let _ = writeln!(out, "# AmneziaWG Client Configuration");
        let _ = writeln!(out, "# Server: {}", export.server_name);
        let _ = writeln!(out, "# Client: {}", export.client_name);
        let _ = writeln!(
            out,
            "# Generated: {}",
            export.generated_at.format("%a %b %e %H:%M:%S %Y")
        );
        let _ = writeln!(out, "# Server IP: {}:{}", export.endpoint_host, export.port);
        out.push('\n');
    }

    let dns = export
        .dns
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "PrivateKey = {}", export.private_key.to_base64());
    let _ = writeln!(out, "Address = {}/32", export.client_ip);
    let _ = writeln!(out, "DNS = {dns}");
    let _ = writeln!(out, "MTU = {}", export.mtu);
    if let Some(params) = export.obfuscation {
        for line in params.scalar_lines().iter().chain(&params.signature_lines()) {
            let _ = writeln!(out, "{line}");
        }
    }

    out.push('\n');
    let _ = writeln!(out, "[Peer]");
    let _ = writeln!(out, "PublicKey = {}", export.server_public_key);
    let _ = writeln!(out, "PresharedKey = {}", export.preshared_key.to_base64());
    let _ = writeln!(out, "Endpoint = {}:{}", export.endpoint_host, export.port);
    let _ = writeln!(out, "AllowedIPs = 0.0.0.0/0");
    let _ = writeln!(out, "PersistentKeepalive = 25");
    out
}

static UNSAFE_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]+").unwrap_or_else(|_| unreachable!()));

const MAX_FILENAME_LEN: usize = 200;

/// Download filename `<client>_<server>.conf`, reduced to `[A-Za-z0-9._-]`.
#[must_use]
pub fn safe_filename(client_name: &str, server_name: &str) -> String {
    let raw = format!("{client_name}_{server_name}.conf");
    let replaced = UNSAFE_FILENAME_CHARS.replace_all(&raw, "_");
    let trimmed = replaced.trim_matches(['.', '_']);
    let mut name: String = trimmed.chars().take(MAX_FILENAME_LEN).collect();
    if name.is_empty() {
        name = "client".to_string();
    }
    if !name.to_ascii_lowercase().ends_with(".conf") {
        name.push_str(".conf");
    }
    name
}

/// Writes `contents` to a sibling temporary file and renames it over
/// `path`, so readers see either the old or the new file. The file is
/// created with mode 0600 on unix.
///
/// # Errors
///
/// Returns an I/O error if any step fails; `path` is left untouched.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))?;
    }

    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KEY_SIZE;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use test_case::test_case;

    fn pubkey(b: u8) -> PublicKey {
        PublicKey::from_bytes_array([b; KEY_SIZE])
    }

    fn psk(b: u8) -> PresharedKey {
        PresharedKey::from_bytes_array([b; KEY_SIZE])
    }

    fn header() -> String {
        let mut rng = StdRng::seed_from_u64(4);
        let params = ObfuscationParams::generate(1400, &mut rng).expect("params");
        render_server_interface(&ServerInterface {
            private_key: &PrivateKey::from_bytes_array([1; KEY_SIZE]),
            address: Ipv4Addr::new(10, 8, 0, 1),
            prefix_len: 24,
            listen_port: 51820,
            mtu: 1400,
            obfuscation: Some(&params),
        })
    }

    #[test]
    fn server_interface_layout() {
        let text = header();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "[Interface]");
        assert_eq!(lines[2], "Address = 10.8.0.1/24");
        assert_eq!(lines[3], "ListenPort = 51820");
        assert_eq!(lines[4], "SaveConfig = false");
        assert_eq!(lines[5], "MTU = 1400");
        assert_eq!(lines.len(), 6 + 9);
        assert!(text.ends_with('\n'));
    }

    #[test_case("" ; "empty")]
    #[test_case("[Interface]\nMTU = 1280\n" ; "header only")]
    #[test_case("[Interface]\n\n# Client: a\n[Peer]\n\n# Client: b\n[Peer]\n" ; "with peers")]
    #[test_case("[Interface]\r\n# Client: a\r\n[Peer]" ; "crlf no final newline")]
    fn parse_display_is_identity(text: &str) {
        assert_eq!(ServerConf::parse(text).to_string(), text);
    }

    #[test]
    fn append_writes_marker_and_peer() {
        let mut conf = ServerConf::parse(&header());
        conf.append_peer("alice", &pubkey(2), &psk(3), Ipv4Addr::new(10, 8, 0, 2));
        let text = conf.to_string();

        let expected_tail = format!(
            "\n# Client: alice\n[Peer]\nPublicKey = {}\nPresharedKey = {}\nAllowedIPs = 10.8.0.2/32\n",
            pubkey(2).to_base64(),
            psk(3).to_base64()
        );
        assert!(text.ends_with(&expected_tail));
        assert_eq!(text.matches("# Client:").count(), 1);
        assert!(conf.contains_peer("alice"));
    }

    #[test]
    fn append_then_remove_restores_bytes() {
        let original = header();
        let mut conf = ServerConf::parse(&original);
        conf.append_peer("alice", &pubkey(2), &psk(3), Ipv4Addr::new(10, 8, 0, 2));

        let mut reparsed = ServerConf::parse(&conf.to_string());
        assert!(reparsed.remove_peer("alice"));
        assert_eq!(reparsed.to_string(), original);
    }

    #[test]
    fn append_normalizes_missing_final_newline() {
        let mut conf = ServerConf::parse("[Interface]\nMTU = 1280");
        conf.append_peer("a", &pubkey(2), &psk(3), Ipv4Addr::new(10, 0, 0, 2));
        assert!(conf.to_string().starts_with("[Interface]\nMTU = 1280\n\n# Client: a\n"));

        assert!(conf.remove_peer("a"));
        assert_eq!(conf.to_string(), "[Interface]\nMTU = 1280\n");
    }

    #[test]
    fn remove_middle_keeps_neighbors_byte_identical() {
        let mut conf = ServerConf::parse(&header());
        conf.append_peer("alice", &pubkey(2), &psk(3), Ipv4Addr::new(10, 8, 0, 2));
        conf.append_peer("bob", &pubkey(4), &psk(5), Ipv4Addr::new(10, 8, 0, 3));
        conf.append_peer("carol", &pubkey(6), &psk(7), Ipv4Addr::new(10, 8, 0, 4));

        let mut expected = ServerConf::parse(&header());
        expected.append_peer("alice", &pubkey(2), &psk(3), Ipv4Addr::new(10, 8, 0, 2));
        expected.append_peer("carol", &pubkey(6), &psk(7), Ipv4Addr::new(10, 8, 0, 4));

        let mut reparsed = ServerConf::parse(&conf.to_string());
        assert!(reparsed.remove_peer("bob"));
        assert_eq!(reparsed.to_string(), expected.to_string());
    }

    #[test]
    fn remove_requires_exact_marker() {
        let mut conf = ServerConf::parse(&header());
        conf.append_peer("alice", &pubkey(2), &psk(3), Ipv4Addr::new(10, 8, 0, 2));
        conf.append_peer("alice2", &pubkey(4), &psk(5), Ipv4Addr::new(10, 8, 0, 3));

        assert!(!conf.remove_peer("ali"));
        assert!(conf.remove_peer("alice"));
        assert!(conf.contains_peer("alice2"));
        assert_eq!(conf.peers().len(), 1);
        assert_eq!(conf.peers()[0].client_name(), "alice2");
    }

    #[test]
    fn remove_only_first_duplicate() {
        let mut conf = ServerConf::parse("[Interface]\n");
        conf.append_peer("dup", &pubkey(2), &psk(3), Ipv4Addr::new(10, 0, 0, 2));
        conf.append_peer("dup", &pubkey(4), &psk(5), Ipv4Addr::new(10, 0, 0, 3));

        assert!(conf.remove_peer("dup"));
        assert_eq!(conf.peers().len(), 1);
        assert!(conf.to_string().contains(&pubkey(4).to_base64()));
    }

    #[test]
    fn preview_strips_terminators() {
        let conf = ServerConf::parse(&header());
        let preview = conf.preview(3);
        assert_eq!(preview.len(), 3);
        assert_eq!(preview[0], "[Interface]");
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = ServerConf::load(&dir.path().join("absent.conf")).expect("load");
        assert_eq!(conf, ServerConf::default());
    }

    #[test]
    fn save_replaces_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("wg-abc.conf");
        std::fs::write(&path, "old").expect("seed");

        let conf = ServerConf::parse(&header());
        conf.save(&path).expect("save");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), header());
        assert_eq!(std::fs::read_dir(dir.path()).expect("ls").count(), 1);
    }

    fn export<'a>(
        private: &'a PrivateKey,
        server_pub: &'a PublicKey,
        psk: &'a PresharedKey,
        dns: &'a [Ipv4Addr],
        params: Option<&'a ObfuscationParams>,
    ) -> ClientExport<'a> {
        ClientExport {
            server_name: "Main",
            client_name: "alice",
            endpoint_host: "203.0.113.7",
            port: 51820,
            private_key: private,
            client_ip: Ipv4Addr::new(10, 8, 0, 2),
            dns,
            mtu: 1400,
            obfuscation: params,
            server_public_key: server_pub,
            preshared_key: psk,
            generated_at: Local::now(),
        }
    }

    #[test]
    fn client_config_clean_layout() {
        let private = PrivateKey::from_bytes_array([8; KEY_SIZE]);
        let server_pub = pubkey(9);
        let key = psk(10);
        let dns = [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)];
        let text = render_client_config(&export(&private, &server_pub, &key, &dns, None), false);

        let expected = format!(
            "[Interface]\nPrivateKey = {}\nAddress = 10.8.0.2/32\nDNS = 8.8.8.8, 1.1.1.1\nMTU = 1400\n\n\
             [Peer]\nPublicKey = {}\nPresharedKey = {}\nEndpoint = 203.0.113.7:51820\n\
             AllowedIPs = 0.0.0.0/0\nPersistentKeepalive = 25\n",
            private.to_base64(),
            server_pub.to_base64(),
            key.to_base64()
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn client_config_with_comments_and_obfuscation() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut params = ObfuscationParams::generate(1400, &mut rng).expect("params");
        params.i_params.i1 = "<b 0x01>\n".to_string();

        let private = PrivateKey::from_bytes_array([8; KEY_SIZE]);
        let server_pub = pubkey(9);
        let key = psk(10);
        let dns = [Ipv4Addr::new(8, 8, 8, 8)];
        let text = render_client_config(
            &export(&private, &server_pub, &key, &dns, Some(&params)),
            true,
        );

        assert!(text.starts_with("# AmneziaWG Client Configuration\n# Server: Main\n# Client: alice\n# Generated: "));
        assert!(text.contains("# Server IP: 203.0.113.7:51820\n\n[Interface]\n"));
        assert!(text.contains(&format!("H4 = {}\nI1 = <b 0x01>\n\n[Peer]\n", params.h4)));
        assert!(!text.contains("I2 ="));
    }

    #[test_case("alice", "Main", "alice_Main.conf" ; "plain")]
    #[test_case("my phone", "Home/VPN", "my_phone_Home_VPN.conf" ; "spaces and slash")]
    #[test_case("..", "..", "conf.conf" ; "dots trimmed")]
    #[test_case("ünï", "srv", "n__srv.conf" ; "non ascii")]
    fn safe_filename_cases(client: &str, server: &str, expected: &str) {
        assert_eq!(safe_filename(client, server), expected);
    }

    #[test]
    fn safe_filename_truncates_and_keeps_extension() {
        let long = "x".repeat(300);
        let name = safe_filename(&long, "srv");
        assert_eq!(name.len(), 205);
        assert!(name.ends_with(".conf"));
    }
}
