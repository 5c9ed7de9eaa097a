//! End-to-end reverse-tunnel behavior over loopback: a node agent
//! dials the hub, registers, carries a routed session, and the routing
//! entry disappears when the agent goes away.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use shoal_auth::ca::{self, CaKind, CertAuthority};
use shoal_auth::identity::IdentityId;
use shoal_auth::{keys, Identity};
use shoal_common::role::principal;
use shoal_common::Role;
use shoal_tunnel::{run_agent, AgentConfig, RoutingTable, TunnelHub};

fn identity_signed_by(ca: &CertAuthority, uuid: &str, role: Role) -> Identity {
    let private = keys::generate().unwrap();
    let cert = ca::sign_host_cert(
        &ca.signer().unwrap(),
        &ssh_key::PublicKey::from(&private),
        &principal(uuid, &ca.domain),
        role.as_str(),
        None,
    )
    .unwrap();
    Identity {
        id: IdentityId::new(uuid, role),
        key_bytes: keys::encode_private(&private).unwrap(),
        cert_bytes: keys::encode_certificate(&cert).unwrap(),
        private_key: private,
        certificate: cert,
    }
}

async fn wait_until<F: Fn() -> bool>(deadline: Duration, check: F) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

/// A TCP echo server standing in for the node's local SSH listener.
async fn spawn_echo() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn agent_registers_carries_traffic_and_deregisters() {
    let ca = CertAuthority::generate("example.com", CaKind::Host).unwrap();
    let proxy_identity = identity_signed_by(&ca, "u-proxy", Role::Proxy);
    let node_identity = identity_signed_by(&ca, "u-node", Role::Node);

    let router = Arc::new(RoutingTable::new());
    let hub = Arc::new(TunnelHub::new(
        &proxy_identity,
        ca.checkers().unwrap(),
        router.clone(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hub_addr = listener.local_addr().unwrap();
    let hub_cancel = CancellationToken::new();
    tokio::spawn(hub.serve_listener(listener, hub_cancel.clone()));

    let echo_addr = spawn_echo().await;
    let mut agent_cfg = AgentConfig::new(
        node_identity,
        hub_addr.to_string(),
        echo_addr.to_string(),
    );
    agent_cfg.keepalive_interval = Duration::from_millis(100);
    agent_cfg.keepalive_window = Duration::from_millis(500);

    let agent_cancel = CancellationToken::new();
    tokio::spawn(run_agent(agent_cfg, agent_cancel.clone()));

    // Registration appears within a second of the node starting.
    let registered = wait_until(Duration::from_secs(1), || {
        router.lookup("u-node.example.com").is_some()
    })
    .await;
    assert!(registered, "tunnel never registered");

    // A routed session reaches the node's local listener end-to-end.
    let opener = router.lookup("u-node.example.com").unwrap();
    let mut stream = tokio::time::timeout(
        Duration::from_secs(2),
        opener.open("u-node.example.com", 3022),
    )
    .await
    .expect("channel open timed out")
    .expect("channel open failed");

    stream.write_all(b"ping-through-tunnel").await.unwrap();
    let mut buf = [0u8; 19];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&buf, b"ping-through-tunnel");
    drop(stream);

    // Kill the node: the routing entry goes away within a keepalive
    // interval of the transport closing.
    agent_cancel.cancel();
    let removed = wait_until(Duration::from_secs(3), || {
        router.lookup("u-node.example.com").is_none()
    })
    .await;
    assert!(removed, "departed tunnel still registered");

    hub_cancel.cancel();
}

#[tokio::test]
async fn foreign_ca_certificate_never_registers() {
    let ours = CertAuthority::generate("example.com", CaKind::Host).unwrap();
    let theirs = CertAuthority::generate("example.com", CaKind::Host).unwrap();
    let proxy_identity = identity_signed_by(&ours, "u-proxy", Role::Proxy);
    let intruder_identity = identity_signed_by(&theirs, "u-intruder", Role::Node);

    let router = Arc::new(RoutingTable::new());
    let hub = Arc::new(TunnelHub::new(
        &proxy_identity,
        ours.checkers().unwrap(),
        router.clone(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hub_addr = listener.local_addr().unwrap();
    let hub_cancel = CancellationToken::new();
    tokio::spawn(hub.serve_listener(listener, hub_cancel.clone()));

    let mut agent_cfg = AgentConfig::new(
        intruder_identity,
        hub_addr.to_string(),
        "127.0.0.1:1".to_string(),
    );
    agent_cfg.keepalive_interval = Duration::from_millis(100);
    agent_cfg.keepalive_window = Duration::from_millis(500);
    let agent_cancel = CancellationToken::new();
    tokio::spawn(run_agent(agent_cfg, agent_cancel.clone()));

    let registered = wait_until(Duration::from_millis(800), || !router.is_empty()).await;
    assert!(!registered, "foreign-CA tunnel must not register");

    agent_cancel.cancel();
    hub_cancel.cancel();
}
