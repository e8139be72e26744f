//! End-to-end lifecycle scenarios against the fake tunnel interface.
//!
//! These tests verify:
//! 1. Server creation writes the interface block and obfuscation lines
//! 2. Client addresses follow the client count
//! 3. Peer blocks are appended and removed without touching neighbors
//! 4. The client map and the server mirror stay in lockstep
//! 5. State survives a restart

use std::net::Ipv4Addr;

use awg_control::{Controller, CreateServer, RecordingFirewall, ServerStatus, Settings};
use awg_wireguard::FakeTunnelInterface;

const OBFUSCATION_KEYS: [&str; 9] = ["Jc", "Jmin", "Jmax", "S1", "S2", "H1", "H2", "H3", "H4"];

struct Env {
    dir: tempfile::TempDir,
    controller: Controller<FakeTunnelInterface, RecordingFirewall>,
    tunnel: FakeTunnelInterface,
}

fn settings(dir: &std::path::Path) -> Settings {
    let mut settings = Settings::rooted_at(dir);
    settings.enable_geoip = false;
    settings
}

fn env() -> Env {
    let dir = tempfile::tempdir().expect("tempdir");
    let tunnel = FakeTunnelInterface::new();
    let controller = Controller::init(settings(dir.path()), tunnel.clone(), RecordingFirewall::new())
        .expect("init");
    Env {
        dir,
        controller,
        tunnel,
    }
}

fn obfuscated_server() -> CreateServer {
    CreateServer {
        name: Some("Edge".to_string()),
        mtu: Some(1400),
        subnet: Some("10.8.0.0/24".to_string()),
        obfuscation: Some(true),
        auto_start: Some(false),
        ..CreateServer::default()
    }
}

fn count_obfuscation_lines(conf: &str) -> usize {
    conf.lines()
        .filter(|line| {
            line.split_once(" = ")
                .is_some_and(|(key, _)| OBFUSCATION_KEYS.contains(&key))
        })
        .count()
}

fn read(path: &std::path::Path) -> String {
    std::fs::read_to_string(path).expect("read config")
}

// ============================================================================
// Full lifecycle
// ============================================================================

#[tokio::test]
async fn test_create_add_add_delete_scenario() {
    let env = env();
    let server = env
        .controller
        .create_server(obfuscated_server())
        .await
        .expect("create");

    assert_eq!(server.server_ip, Ipv4Addr::new(10, 8, 0, 1));
    assert_eq!(server.interface, format!("wg-{}", server.id));
    assert_eq!(server.status, ServerStatus::Stopped);

    let initial = read(&server.config_path);
    assert!(initial.contains("Address = 10.8.0.1/24\n"));
    assert!(initial.contains("MTU = 1400\n"));
    assert_eq!(count_obfuscation_lines(&initial), 9);

    // alice
    let alice = env
        .controller
        .add_client(&server.id, "alice", None)
        .await
        .expect("alice");
    assert_eq!(alice.client_ip, Ipv4Addr::new(10, 8, 0, 2));
    let with_alice = read(&server.config_path);
    assert!(with_alice.starts_with(&initial));
    assert_eq!(with_alice.matches("# Client: ").count(), 1);
    assert_eq!(with_alice.matches("[Peer]").count(), 1);
    assert!(with_alice.contains(&format!("PublicKey = {}\n", alice.client_public_key)));
    assert!(with_alice.contains("AllowedIPs = 10.8.0.2/32\n"));

    // bob
    let bob = env
        .controller
        .add_client(&server.id, "bob", None)
        .await
        .expect("bob");
    assert_eq!(bob.client_ip, Ipv4Addr::new(10, 8, 0, 3));
    let with_both = read(&server.config_path);
    let bob_block = &with_both[with_both.find("# Client: bob").expect("bob marker")..];

    // delete alice
    env.controller
        .delete_client(&server.id, &alice.id)
        .await
        .expect("delete alice");
    let after = read(&server.config_path);
    assert!(!after.contains("# Client: alice"));
    assert!(!after.contains(&alice.client_public_key.to_base64()));
    assert_eq!(after.matches("[Peer]").count(), 1);
    assert!(after.ends_with(bob_block));
    assert_eq!(after, format!("{initial}\n{bob_block}"));

    let doc = env.controller.snapshot().await;
    assert_eq!(doc.clients.len(), 1);
    assert!(doc.clients.contains_key(&bob.id));
    assert_eq!(doc.servers[0].clients.len(), 1);
    assert_eq!(doc.servers[0].clients[0], doc.clients[&bob.id]);
}

#[tokio::test]
async fn test_append_then_remove_is_byte_identical() {
    let env = env();
    let server = env
        .controller
        .create_server(obfuscated_server())
        .await
        .expect("create");
    env.controller
        .add_client(&server.id, "keep", None)
        .await
        .expect("keep");
    let before = read(&server.config_path);

    let temp = env
        .controller
        .add_client(&server.id, "temp", None)
        .await
        .expect("temp");
    assert_ne!(read(&server.config_path), before);

    env.controller
        .delete_client(&server.id, &temp.id)
        .await
        .expect("delete");
    assert_eq!(read(&server.config_path), before);
}

#[tokio::test]
async fn test_hand_edited_config_without_final_newline() {
    let env = env();
    let server = env
        .controller
        .create_server(obfuscated_server())
        .await
        .expect("create");

    let mut edited = read(&server.config_path);
    edited.push_str("# operator note");
    std::fs::write(&server.config_path, &edited).expect("hand edit");

    let client = env
        .controller
        .add_client(&server.id, "carol", None)
        .await
        .expect("carol");
    let with_carol = read(&server.config_path);
    assert!(with_carol.contains("# operator note\n\n# Client: carol\n"));

    env.controller
        .delete_client(&server.id, &client.id)
        .await
        .expect("delete");
    assert_eq!(read(&server.config_path), format!("{edited}\n"));
}

#[tokio::test]
async fn test_client_ip_after_deletion_does_not_collide() {
    let env = env();
    let server = env
        .controller
        .create_server(obfuscated_server())
        .await
        .expect("create");
    let a = env.controller.add_client(&server.id, "a", None).await.expect("a");
    let b = env.controller.add_client(&server.id, "b", None).await.expect("b");
    env.controller.delete_client(&server.id, &a.id).await.expect("delete a");

    let c = env.controller.add_client(&server.id, "c", None).await.expect("c");
    assert_ne!(c.client_ip, b.client_ip);
    assert_eq!(c.client_ip, Ipv4Addr::new(10, 8, 0, 4));
}

// ============================================================================
// Live reload and lifecycle
// ============================================================================

#[tokio::test]
async fn test_running_server_is_reloaded_not_restarted() {
    let env = env();
    let server = env
        .controller
        .create_server(obfuscated_server())
        .await
        .expect("create");
    env.controller.start_server(&server.id).await.expect("start");

    let alice = env
        .controller
        .add_client(&server.id, "alice", None)
        .await
        .expect("alice");
    env.controller
        .delete_client(&server.id, &alice.id)
        .await
        .expect("delete");

    assert_eq!(env.tunnel.call_count("sync "), 2);
    assert_eq!(env.tunnel.call_count("up "), 1);
    assert_eq!(env.tunnel.call_count("down "), 0);
}

#[tokio::test]
async fn test_status_query_tracks_live_interface() {
    let env = env();
    let server = env
        .controller
        .create_server(obfuscated_server())
        .await
        .expect("create");

    env.tunnel.set_up(&server.interface, true);
    assert_eq!(
        env.controller.server_status(&server.id).await.expect("status"),
        ServerStatus::Running
    );
    assert_eq!(
        env.controller.server_status(&server.id).await.expect("status"),
        ServerStatus::Running
    );

    env.tunnel.set_up(&server.interface, false);
    assert_eq!(
        env.controller.server_status(&server.id).await.expect("status"),
        ServerStatus::Stopped
    );
    assert_eq!(env.controller.snapshot().await.servers.len(), 1);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let env = env();
    let server = env
        .controller
        .create_server(obfuscated_server())
        .await
        .expect("create");
    let alice = env
        .controller
        .add_client(&server.id, "alice", None)
        .await
        .expect("alice");
    env.controller.shutdown().await.expect("shutdown");
    let before = env.controller.snapshot().await;

    let restarted = Controller::init(
        settings(env.dir.path()),
        FakeTunnelInterface::new(),
        RecordingFirewall::new(),
    )
    .expect("restart");
    let after = restarted.snapshot().await;
    assert_eq!(after, before);

    let export = restarted
        .client_config(&server.id, &alice.id, false)
        .await
        .expect("export");
    assert!(export.content.contains("Address = 10.8.0.2/32"));
    assert_eq!(export.content.matches("Jc = ").count(), 1);
}

#[tokio::test]
async fn test_key_tool_failure_falls_back() {
    let env = env();
    env.tunnel.fail_key_generation(true);
    let server = env
        .controller
        .create_server(obfuscated_server())
        .await
        .expect("create with fallback keys");
    let client = env
        .controller
        .add_client(&server.id, "alice", None)
        .await
        .expect("client with fallback keys");
    assert_ne!(client.client_public_key, server.server_public_key);
    assert!(env.tunnel.last_generated_keypair().is_none());
}
