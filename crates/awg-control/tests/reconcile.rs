//! Traffic reconciliation against scripted status dumps.
//!
//! These tests verify:
//! 1. Peers map to clients by public key and drive client status
//! 2. Status writes are throttled but never lost
//! 3. One failing server does not stop the sweep
//! 4. Traffic updates reach subscribers

use std::time::{Duration, Instant};

use awg_control::{
    Client, ClientStatus, ControlEvent, Controller, CreateServer, GeoLocator, RecordingFirewall,
    Server, Settings,
};
use awg_wireguard::FakeTunnelInterface;
use serde_json::json;

struct Env {
    _dir: tempfile::TempDir,
    state_file: std::path::PathBuf,
    controller: Controller<FakeTunnelInterface, RecordingFirewall>,
    tunnel: FakeTunnelInterface,
}

fn env() -> Env {
    let dir = tempfile::tempdir().expect("tempdir");
    let settings = Settings::rooted_at(dir.path());
    let state_file = settings.state_file.clone();
    let tunnel = FakeTunnelInterface::new();
    let geo = GeoLocator::disabled().with_lookup(|_| {
        Some(json!({"country": "Netherlands", "city": "Amsterdam", "country_code": "nl"}))
    });
    let controller = Controller::init(settings, tunnel.clone(), RecordingFirewall::new())
        .expect("init")
        .with_geo(geo);
    Env {
        _dir: dir,
        state_file,
        controller,
        tunnel,
    }
}

async fn running_server(env: &Env, subnet: &str) -> Server {
    let server = env
        .controller
        .create_server(CreateServer {
            subnet: Some(subnet.to_string()),
            auto_start: Some(false),
            ..CreateServer::default()
        })
        .await
        .expect("create");
    env.controller.start_server(&server.id).await.expect("start");
    server
}

fn peer(client: &Client, endpoint: Option<&str>, handshake: &str) -> String {
    let endpoint = endpoint
        .map(|e| format!("  endpoint: {e}\n"))
        .unwrap_or_default();
    format!(
        "peer: {key}\n  preshared key: (hidden)\n{endpoint}  allowed ips: {ip}/32\n  latest handshake: {handshake}\n  transfer: 1.39 MiB received, 6.59 MiB sent\n\n",
        key = client.client_public_key.to_base64(),
        ip = client.client_ip,
    )
}

fn dump(server: &Server, peers: &[String]) -> String {
    format!(
        "interface: {}\n  public key: {}\n  private key: (hidden)\n  listening port: {}\n\n{}",
        server.interface,
        server.server_public_key,
        server.port,
        peers.concat()
    )
}

fn persisted_status(env: &Env, client_id: &str) -> String {
    let text = std::fs::read_to_string(&env.state_file).expect("state file");
    let doc: serde_json::Value = serde_json::from_str(&text).expect("json");
    doc["clients"][client_id]["status"]
        .as_str()
        .expect("status")
        .to_string()
}

async fn client_status(env: &Env, client_id: &str) -> ClientStatus {
    env.controller.snapshot().await.clients[client_id].status
}

// ============================================================================
// Peer matching
// ============================================================================

#[tokio::test]
async fn test_handshake_drives_client_status() {
    let env = env();
    let server = running_server(&env, "10.8.0.0/24").await;
    let alice = env.controller.add_client(&server.id, "alice", None).await.expect("alice");
    let bob = env.controller.add_client(&server.id, "bob", None).await.expect("bob");

    env.tunnel.set_show_output(
        &server.interface,
        dump(
            &server,
            &[
                peer(&alice, Some("203.0.113.10:51820"), "57 seconds ago"),
                peer(&bob, None, "Never"),
            ],
        ),
    );

    let traffic = env.controller.server_traffic(&server.id).await.expect("traffic");
    assert_eq!(traffic.len(), 2);

    let a = &traffic[&alice.id];
    assert!(a.active);
    assert_eq!(a.latest_handshake_seconds, Some(57));
    assert_eq!(a.endpoint.as_deref(), Some("203.0.113.10:51820"));
    assert_eq!(a.geo.as_deref(), Some("Netherlands / Amsterdam"));
    assert_eq!(a.geo_country_code.as_deref(), Some("NL"));

    let b = &traffic[&bob.id];
    assert!(!b.active);
    assert_eq!(b.latest_handshake_seconds, None);
    assert!(b.geo.is_none());

    assert_eq!(client_status(&env, &alice.id).await, ClientStatus::Active);
    assert_eq!(client_status(&env, &bob.id).await, ClientStatus::Inactive);
}

#[tokio::test]
async fn test_unknown_peer_leaves_client_inactive() {
    let env = env();
    let server = running_server(&env, "10.8.0.0/24").await;
    let alice = env.controller.add_client(&server.id, "alice", None).await.expect("alice");
    let mut stranger = alice.clone();
    stranger.client_public_key = awg_wireguard::PublicKey::from_bytes_array([9; 32]);

    env.tunnel.set_show_output(
        &server.interface,
        dump(&server, &[peer(&stranger, None, "3 seconds ago")]),
    );

    let traffic = env.controller.server_traffic(&server.id).await.expect("traffic");
    let a = &traffic[&alice.id];
    assert!(!a.active);
    assert_eq!(a.received, "0 B");
    assert_eq!(a.sent, "0 B");
    assert_eq!(client_status(&env, &alice.id).await, ClientStatus::Inactive);
}

#[tokio::test]
async fn test_empty_dump_changes_nothing() {
    let env = env();
    let server = running_server(&env, "10.8.0.0/24").await;
    let alice = env.controller.add_client(&server.id, "alice", None).await.expect("alice");

    env.tunnel.set_show_output(
        &server.interface,
        dump(&server, &[peer(&alice, None, "5 seconds ago")]),
    );
    env.controller.server_traffic(&server.id).await.expect("traffic");
    assert_eq!(client_status(&env, &alice.id).await, ClientStatus::Active);

    env.tunnel.set_show_output(&server.interface, "");
    let traffic = env.controller.server_traffic(&server.id).await.expect("traffic");
    assert!(traffic.is_empty());
    assert_eq!(client_status(&env, &alice.id).await, ClientStatus::Active);
}

// ============================================================================
// Persistence throttle
// ============================================================================

#[tokio::test]
async fn test_status_writes_are_throttled() {
    let env = env();
    let server = running_server(&env, "10.8.0.0/24").await;
    let alice = env.controller.add_client(&server.id, "alice", None).await.expect("alice");
    let reconciler = env.controller.reconciler();
    let t0 = Instant::now();

    env.tunnel.set_show_output(
        &server.interface,
        dump(&server, &[peer(&alice, None, "57 seconds ago")]),
    );
    assert_eq!(reconciler.sweep_at(t0).await, 1);
    assert_eq!(persisted_status(&env, &alice.id), "active");

    env.tunnel.set_show_output(
        &server.interface,
        dump(&server, &[peer(&alice, None, "Never")]),
    );
    reconciler.sweep_at(t0 + Duration::from_secs(7)).await;
    assert_eq!(client_status(&env, &alice.id).await, ClientStatus::Inactive);
    assert_eq!(persisted_status(&env, &alice.id), "active");

    reconciler.sweep_at(t0 + Duration::from_secs(60)).await;
    assert_eq!(persisted_status(&env, &alice.id), "inactive");
}

#[tokio::test]
async fn test_throttled_status_is_flushed_on_shutdown() {
    let env = env();
    let server = running_server(&env, "10.8.0.0/24").await;
    let alice = env.controller.add_client(&server.id, "alice", None).await.expect("alice");
    let reconciler = env.controller.reconciler();
    let t0 = Instant::now();

    env.tunnel.set_show_output(
        &server.interface,
        dump(&server, &[peer(&alice, None, "57 seconds ago")]),
    );
    reconciler.sweep_at(t0).await;
    env.tunnel.set_show_output(
        &server.interface,
        dump(&server, &[peer(&alice, None, "Never")]),
    );
    reconciler.sweep_at(t0 + Duration::from_secs(1)).await;
    assert_eq!(persisted_status(&env, &alice.id), "active");

    env.controller.shutdown().await.expect("shutdown");
    assert_eq!(persisted_status(&env, &alice.id), "inactive");
}

// ============================================================================
// Sweep behavior
// ============================================================================

#[tokio::test]
async fn test_failing_server_does_not_stop_sweep() {
    let env = env();
    let broken = running_server(&env, "10.8.0.0/24").await;
    let healthy = running_server(&env, "10.9.0.0/24").await;
    env.controller.add_client(&broken.id, "x", None).await.expect("x");
    let alice = env.controller.add_client(&healthy.id, "alice", None).await.expect("alice");

    env.tunnel
        .set_show_output(&broken.interface, "unable to access interface: No such device\n");
    env.tunnel.set_show_output(
        &healthy.interface,
        dump(&healthy, &[peer(&alice, None, "1 minute, 2 seconds ago")]),
    );

    let polled = env.controller.reconciler().sweep().await;
    assert_eq!(polled, 2);
    assert_eq!(client_status(&env, &alice.id).await, ClientStatus::Active);
}

#[tokio::test]
async fn test_stopped_servers_are_not_polled() {
    let env = env();
    let server = running_server(&env, "10.8.0.0/24").await;
    env.controller.stop_server(&server.id).await.expect("stop");

    let polled = env.controller.reconciler().sweep().await;
    assert_eq!(polled, 0);
    assert_eq!(env.tunnel.call_count("show "), 0);
}

#[tokio::test]
async fn test_sweep_publishes_traffic_update() {
    let env = env();
    let server = running_server(&env, "10.8.0.0/24").await;
    let alice = env.controller.add_client(&server.id, "alice", None).await.expect("alice");
    let mut events = env.controller.subscribe();

    env.tunnel.set_show_output(
        &server.interface,
        dump(&server, &[peer(&alice, None, "10 seconds ago")]),
    );
    env.controller.reconciler().sweep().await;

    let event = events.try_recv().expect("traffic event");
    match event {
        ControlEvent::TrafficUpdate { server_id, traffic } => {
            assert_eq!(server_id, server.id);
            assert!(traffic[&alice.id].active);
            assert_eq!(traffic[&alice.id].received, "1.39 MiB received");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_cancel() {
    let env = env();
    let server = running_server(&env, "10.8.0.0/24").await;
    let cancel = tokio_util::sync::CancellationToken::new();
    let task = tokio::spawn(
        env.controller
            .reconciler()
            .run(Duration::from_secs(5), cancel.clone()),
    );

    tokio::time::sleep(Duration::from_secs(11)).await;
    cancel.cancel();
    task.await.expect("join");

    assert!(env.tunnel.call_count(&format!("show {}", server.interface)) >= 2);
}
