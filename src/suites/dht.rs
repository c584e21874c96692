//! Join, stabilization and key/value tests for a DHT peer

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure};

use crate::harness::{collect_trace, ring_settle, RegistryResult, TestContext, TestRegistry};
use crate::network::{HandlerKind, MockServer};
use crate::process::Supervisor;
use crate::protocol::{ControlMethod, ControlPacket, DataPacket, Packet, DEFAULT_ANCHOR_PORT};

const LOCALHOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Node ids of the four-peer ring
const RING: [u16; 4] = [512, 1024, 2048, 4096];
const RING_PORT_BASE: u16 = 4000;

pub fn register(registry: &mut TestRegistry) -> RegistryResult<()> {
    registry.register("trigger_join_minimal", |ctx| Box::pin(trigger_join_minimal(ctx)))?;
    registry.register("join_correct", |ctx| Box::pin(join_correct(ctx)))?;
    registry.register("full_join", |ctx| Box::pin(full_join(ctx)))?;
    registry.register("initial_ring", |ctx| Box::pin(initial_ring(ctx)))?;
    registry.register("join_mock_peer", |ctx| Box::pin(join_mock_peer(ctx)))?;
    registry.register("set_get_ring", |ctx| Box::pin(set_get_ring(ctx)))?;
    registry.register("finger_table_get", |ctx| Box::pin(finger_table_get(ctx)))?;
    registry.register("finger_table_no_ack", |ctx| Box::pin(finger_table_no_ack(ctx)))?;
    registry.register("set_get_ring_without_first_id", |ctx| {
        Box::pin(set_get_ring_without_first_id(ctx))
    })?;
    Ok(())
}

/// Responsibility hash used by the peers: the first two key bytes
pub fn pseudo_hash(key: &[u8]) -> u16 {
    match key {
        [] => 0,
        [only] => u16::from(*only) << 8,
        [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
    }
}

fn anchor_at(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(LOCALHOST, port)
}

/// Next control packet captured by `server`, or a failure carrying the
/// peers' output
async fn expect_control(
    server: &MockServer,
    timeout: Duration,
    peers: &[Arc<Supervisor>],
    missing: &str,
) -> anyhow::Result<ControlPacket> {
    match server.await_control(timeout).await? {
        Some(packet) => Ok(packet),
        None => bail!("{} {}", missing, collect_trace(peers).await),
    }
}

async fn trigger_join_minimal(ctx: TestContext) -> anyhow::Result<()> {
    let anchor = ctx.start_peer(DEFAULT_ANCHOR_PORT, HandlerKind::Control).await?;
    let peer = ctx
        .start_student_peer(1401, Some(42), Some(anchor_at(DEFAULT_ANCHOR_PORT)), LOCALHOST)
        .await?;

    expect_control(
        &anchor,
        Duration::from_secs(1),
        &[peer],
        "Did not receive a JOIN msg within timeout!",
    )
    .await?;
    Ok(())
}

async fn join_correct(ctx: TestContext) -> anyhow::Result<()> {
    let node_id = 42;
    let node_port = 2000;

    let anchor = ctx.start_peer(DEFAULT_ANCHOR_PORT, HandlerKind::Control).await?;
    let peer = ctx
        .start_student_peer(node_port, Some(node_id), Some(anchor_at(DEFAULT_ANCHOR_PORT)), LOCALHOST)
        .await?;

    let join = expect_control(
        &anchor,
        Duration::from_secs(2),
        &[peer],
        "Did not receive a JOIN msg within timeout!",
    )
    .await?;

    ensure!(join.method == ControlMethod::Join, "Expected JOIN but got {}", join.method);
    ensure!(join.node_id == node_id, "Peer sent wrong node id in JOIN msg.");
    ensure!(join.ip == LOCALHOST, "Peer sent wrong ip in JOIN msg. Raw packet: {:?}", join.raw);
    ensure!(join.port == node_port, "Peer sent wrong port in JOIN msg.");
    Ok(())
}

async fn full_join(ctx: TestContext) -> anyhow::Result<()> {
    let node_id = 42;
    let node_port = 2000;
    let succ_id = 100;
    let pre_id = 10;
    let pre_port = 1401;

    let anchor = ctx.start_peer(DEFAULT_ANCHOR_PORT, HandlerKind::General).await?;
    anchor.set_auto_respond(true);

    // The anchor answers the JOIN by notifying the peer of its successor
    let notify = ControlPacket::new(ControlMethod::Notify, 0, succ_id, LOCALHOST, DEFAULT_ANCHOR_PORT);
    anchor.enqueue_response((notify, LOCALHOST.to_string(), node_port));

    tracing::debug!("Start student peer");
    let peer = ctx
        .start_student_peer(node_port, Some(node_id), Some(anchor_at(DEFAULT_ANCHOR_PORT)), LOCALHOST)
        .await?;
    let peers = [peer];

    tracing::debug!("Waiting for join packet");
    let join = expect_control(
        &anchor,
        Duration::from_secs(2),
        &peers,
        "Did not receive a JOIN msg within timeout!",
    )
    .await?;
    tracing::debug!("Received packet type: {}", join.method);

    tracing::debug!("Sending stabilize");
    let stabilize = ControlPacket::new(ControlMethod::Stabilize, 0, pre_id, LOCALHOST, pre_port);
    let pre = ctx.start_client(stabilize, node_port).await?;

    let notify2 = match pre.await_packet(Duration::from_millis(2500)).await {
        Ok(Some(packet)) => packet,
        Ok(None) => bail!(
            "Did not receive a NOTIFY response for stabilize msg within timeout! {}",
            collect_trace(&peers).await
        ),
        Err(_) => bail!(
            "Peer closed connection after STABILIZE! Either it crashed or it tries to send \
             NOTIFY in a separate connection!"
        ),
    };
    let method = notify2.as_control().map(|p| p.method);
    ensure!(method == Some(ControlMethod::Notify), "Expected NOTIFY but got {:?}", method);

    // The scripted forward has been delivered; capture from now on only
    anchor.set_auto_respond(false);

    let stabilize2 = expect_control(
        &anchor,
        Duration::from_secs(5),
        &peers,
        "Did not receive a STABILIZE within timeout after JOIN!",
    )
    .await?;
    ensure!(
        stabilize2.method == ControlMethod::Stabilize,
        "Expected STABILIZE but got {}",
        stabilize2.method
    );

    // Not ours, must be forwarded to the successor
    let lookup1 = ControlPacket::new(ControlMethod::Lookup, pre_id - 5, 9999, LOCALHOST, pre_port);
    ctx.start_client(lookup1, node_port).await?;

    let forwarded = expect_control(
        &anchor,
        Duration::from_secs(2),
        &peers,
        "Peer did not forward lookup to succ within timeout! JOIN might not be completed.",
    )
    .await?;
    ensure!(
        forwarded.method == ControlMethod::Lookup,
        "Expected LOOKUP but got {} instead. Is the peer spamming STABILIZE?",
        forwarded.method
    );

    // Owned by the successor, the peer replies itself
    let lookup2 = ControlPacket::new(ControlMethod::Lookup, succ_id - 1, 9999, LOCALHOST, DEFAULT_ANCHOR_PORT);
    ctx.start_client(lookup2, node_port).await?;

    let reply = expect_control(
        &anchor,
        Duration::from_secs(2),
        &peers,
        "Peer did not reply to lookup within timeout! JOIN might not be completed.",
    )
    .await?;
    ensure!(reply.method == ControlMethod::Reply, "Expected REPLY but got {}", reply.method);
    ensure!(reply.node_id == succ_id, "REPLY names node {} instead of {}", reply.node_id, succ_id);
    Ok(())
}

async fn initial_ring(ctx: TestContext) -> anyhow::Result<()> {
    let node_id = 42;
    let node_port = 2000;
    let other_id = 123;

    let peer = ctx.start_student_peer(node_port, Some(node_id), None, LOCALHOST).await?;
    let peers = [peer];
    let other = ctx.start_peer(DEFAULT_ANCHOR_PORT, HandlerKind::General).await?;

    let join = ControlPacket::new(ControlMethod::Join, 0, other_id, LOCALHOST, DEFAULT_ANCHOR_PORT);
    ctx.start_client(join, node_port).await?;

    let notify = expect_control(
        &other,
        Duration::from_secs(2),
        &peers,
        "Peer did not reply to JOIN within timeout! Expected NOTIFY.",
    )
    .await?;
    ensure!(notify.method == ControlMethod::Notify, "Expected NOTIFY but got {}", notify.method);
    ensure!(notify.node_id == node_id, "NOTIFY carries node id {}", notify.node_id);
    ensure!(notify.ip == LOCALHOST, "NOTIFY carries ip {}", notify.ip);
    ensure!(notify.port == node_port, "NOTIFY carries port {}", notify.port);

    let stabilize = expect_control(
        &other,
        Duration::from_millis(2500),
        &peers,
        "Peer did not send STABILIZE within timeout!",
    )
    .await?;
    ensure!(
        stabilize.method == ControlMethod::Stabilize,
        "Expected STABILIZE but got {}",
        stabilize.method
    );
    ensure!(stabilize.node_id == node_id, "STABILIZE carries node id {}", stabilize.node_id);
    Ok(())
}

async fn join_mock_peer(ctx: TestContext) -> anyhow::Result<()> {
    let node1_id = 100;
    let node1_port = 2000;
    let node2_id = 200;
    let node2_port = 2001;
    let mock_id = 150;

    let peer1 = ctx.start_student_peer(node1_port, Some(node1_id), None, LOCALHOST).await?;
    let peer2 = ctx
        .start_student_peer(node2_port, Some(node2_id), Some(anchor_at(node1_port)), LOCALHOST)
        .await?;
    let peers = [peer1, peer2];

    let mock = ctx.start_peer(DEFAULT_ANCHOR_PORT, HandlerKind::General).await?;
    mock.set_auto_respond(true);
    // Do not respond to the NOTIFY
    mock.enqueue_response(Packet::Null);

    let join = ControlPacket::new(ControlMethod::Join, 0, mock_id, LOCALHOST, DEFAULT_ANCHOR_PORT);
    ctx.start_client(join, node1_port).await?;

    let notify = expect_control(
        &mock,
        Duration::from_millis(2500),
        &peers,
        "Peer did not reply to JOIN within timeout! Expected NOTIFY.",
    )
    .await?;
    ensure!(notify.method == ControlMethod::Notify, "Expected NOTIFY but got {}", notify.method);
    ensure!(notify.node_id == node2_id, "NOTIFY carries node id {}", notify.node_id);

    let mut stabilize = expect_control(
        &mock,
        Duration::from_secs(5),
        &peers,
        "Peer did not send STABILIZE within timeout!",
    )
    .await?;

    // The mock may have joined before the second peer finished, so retry
    let mut attempts = 0;
    loop {
        ensure!(
            stabilize.method == ControlMethod::Stabilize,
            "Expected STABILIZE but got {}",
            stabilize.method
        );
        mock.enqueue_response(ControlPacket::new(
            ControlMethod::Notify,
            0,
            stabilize.node_id,
            stabilize.ip,
            stabilize.port,
        ));
        if stabilize.node_id == node1_id || attempts == 3 {
            break;
        }

        tracing::debug!("Trying again");
        attempts += 1;
        stabilize = expect_control(
            &mock,
            Duration::from_secs(5),
            &peers,
            "Peer did not send STABILIZE within timeout!",
        )
        .await?;
    }

    ensure!(
        stabilize.node_id == node1_id,
        "STABILIZE carries node id {} instead of {}",
        stabilize.node_id,
        node1_id
    );
    Ok(())
}

/// SET through one peer; returns once the ACK arrived
async fn set_value(
    ctx: &TestContext,
    peers: &[Arc<Supervisor>],
    port: u16,
    key: &'static [u8],
    value: &'static [u8],
) -> anyhow::Result<()> {
    let set = ctx.start_client(DataPacket::set(key, value), port).await?;
    if set.await_packet(Duration::from_secs(2)).await.is_err() {
        bail!("Did not receive ACK packet. Trace: {}", collect_trace(peers).await);
    }
    Ok(())
}

/// GET through one peer and compare the value
async fn expect_value(
    ctx: &TestContext,
    peers: &[Arc<Supervisor>],
    port: u16,
    key: &'static [u8],
    value: &'static [u8],
) -> anyhow::Result<()> {
    let get = ctx.start_client(DataPacket::get(key), port).await?;
    let reply = match get.await_packet(Duration::from_secs(2)).await {
        Ok(Some(reply)) => reply,
        _ => bail!(
            "Did not receive response for GET request! {}",
            collect_trace(peers).await
        ),
    };
    let got = reply.as_data().map(|data| data.value.clone());
    ensure!(
        got.as_deref() == Some(value),
        "GET returned {:?} instead of {:?}",
        got,
        value
    );
    Ok(())
}

fn finger_request() -> ControlPacket {
    ControlPacket::new(ControlMethod::Finger, 0, 0, Ipv4Addr::UNSPECIFIED, 0)
}

async fn ring_set_get(ctx: TestContext, ignore_first_id: bool, nodes: [u16; 4]) -> anyhow::Result<()> {
    let key = b"Good Thinking!";
    let value = b"You have invited all my friends!";

    let ring = ctx.setup_student_ring(&nodes, RING_PORT_BASE, ignore_first_id).await?;
    tokio::time::sleep(ring_settle(nodes.len())).await;

    set_value(&ctx, &ring.peers, ring.ports[0], key, value).await?;
    expect_value(&ctx, &ring.peers, ring.ports[3], key, value).await
}

async fn set_get_ring(ctx: TestContext) -> anyhow::Result<()> {
    ring_set_get(ctx, false, RING).await
}

async fn set_get_ring_without_first_id(ctx: TestContext) -> anyhow::Result<()> {
    ring_set_get(ctx, true, [0, 1024, 2048, 4096]).await
}

async fn finger_table_get(ctx: TestContext) -> anyhow::Result<()> {
    let key = b"Where's the money, Donny!!";
    let value = b"Oh! Hi, Marc!";

    let ring = ctx.setup_student_ring(&RING, RING_PORT_BASE, false).await?;
    tokio::time::sleep(ring_settle(RING.len())).await;
    let port = ring.ports[0];

    set_value(&ctx, &ring.peers, port, key, value).await?;

    let finger = ctx.start_client(finger_request(), port).await?;
    if finger.await_packet(Duration::from_secs(2)).await.is_err() {
        bail!("Did not receive FACK packet. Trace: {}", collect_trace(&ring.peers).await);
    }

    expect_value(&ctx, &ring.peers, port, key, value).await
}

async fn finger_table_no_ack(ctx: TestContext) -> anyhow::Result<()> {
    let key = b"Where's the money, Donny!!";
    let value = b"Oh! Hi, Marc!";

    let ring = ctx.setup_student_ring(&RING, RING_PORT_BASE, false).await?;
    tokio::time::sleep(ring_settle(RING.len())).await;
    let port = ring.ports[0];

    set_value(&ctx, &ring.peers, port, key, value).await?;

    // Give the peer time to build its finger table without awaiting the FACK
    ctx.start_client(finger_request(), port).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    expect_value(&ctx, &ring.peers, port, key, value).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::harness::Runner;
    use crate::network::{connect_and_send, Connection};
    use crate::protocol::DataMethod;
    use bytes::Bytes;
    use std::path::PathBuf;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Mutex;

    #[test]
    fn test_pseudo_hash() {
        assert_eq!(pseudo_hash(b""), 0);
        assert_eq!(pseudo_hash(b"\x01"), 0x0100);
        assert_eq!(pseudo_hash(b"\x12\x34"), 0x1234);
        assert_eq!(pseudo_hash(b"Good Thinking!"), u16::from_be_bytes([b'G', b'o']));
    }

    #[test]
    fn test_registers_all_tests_in_order() {
        let mut registry = TestRegistry::new();
        register(&mut registry).unwrap();
        let names: Vec<_> = registry.names().collect();
        assert_eq!(names.len(), 9);
        assert_eq!(names[0], "trigger_join_minimal");
        assert_eq!(names[8], "set_get_ring_without_first_id");

        assert!(register(&mut registry).is_err());
    }

    /// Arguments the launch script hands to [`scripted_peer`]
    const PEER_ARGS_VAR: &str = "TESTBENCH_PEER_ARGS";
    /// Directory the scripted peers share as their key/value store
    const PEER_STORE_VAR: &str = "TESTBENCH_PEER_STORE";

    #[derive(Debug, Clone, Copy)]
    struct Node {
        id: u16,
        ip: Ipv4Addr,
        port: u16,
    }

    impl Node {
        fn control(&self, method: ControlMethod, hash_id: u16) -> Packet {
            ControlPacket::new(method, hash_id, self.id, self.ip, self.port).into()
        }

        async fn send(&self, packet: &Packet) -> anyhow::Result<()> {
            connect_and_send(packet, &self.ip.to_string(), self.port, Duration::from_secs(1)).await?;
            Ok(())
        }
    }

    impl From<&ControlPacket> for Node {
        fn from(p: &ControlPacket) -> Self {
            Self {
                id: p.node_id,
                ip: p.ip,
                port: p.port,
            }
        }
    }

    #[derive(Debug, Default, Clone, Copy)]
    struct Neighbours {
        pred: Option<Node>,
        succ: Option<Node>,
    }

    /// Minimal well-behaved peer: joins through its anchor, answers
    /// STABILIZE with NOTIFY, routes lookups and keeps values in a
    /// directory shared by the whole ring.
    struct ScriptedPeer {
        me: Node,
        store: PathBuf,
        ring: Mutex<Neighbours>,
    }

    /// `key` lies in the ring interval `(lo, hi]`
    fn within(lo: u16, hi: u16, key: u16) -> bool {
        if lo < hi {
            lo < key && key <= hi
        } else {
            key > lo || key <= hi
        }
    }

    async fn stabilize_loop(peer: Arc<ScriptedPeer>) {
        tokio::time::sleep(Duration::from_secs(1)).await;
        loop {
            let succ = peer.ring.lock().await.succ;
            if let Some(succ) = succ {
                let _ = succ.send(&peer.me.control(ControlMethod::Stabilize, 0)).await;
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    async fn serve(peer: Arc<ScriptedPeer>, stream: TcpStream) -> anyhow::Result<()> {
        let mut conn = Connection::new(stream, Duration::from_secs(3));
        match conn.recv().await? {
            Packet::Control(p) => match p.method {
                ControlMethod::Notify => {
                    let first = peer.ring.lock().await.succ.replace(Node::from(&p)).is_none();
                    if first {
                        tokio::spawn(stabilize_loop(peer.clone()));
                    }
                }
                ControlMethod::Stabilize => {
                    let pred = Node::from(&p);
                    peer.ring.lock().await.pred = Some(pred);
                    conn.send(&pred.control(ControlMethod::Notify, 0)).await?;
                }
                ControlMethod::Lookup => {
                    let Neighbours { pred, succ } = *peer.ring.lock().await;
                    let origin = Node::from(&p);
                    let me = peer.me;
                    if pred.map_or(false, |pred| within(pred.id, me.id, p.hash_id)) {
                        origin.send(&me.control(ControlMethod::Reply, p.hash_id)).await?;
                    } else if let Some(succ) = succ {
                        if within(me.id, succ.id, p.hash_id) {
                            origin.send(&succ.control(ControlMethod::Reply, p.hash_id)).await?;
                        } else {
                            succ.send(&Packet::Control(p)).await?;
                        }
                    }
                }
                _ => {}
            },
            Packet::Data(d) => {
                let file: String = d.key.iter().map(|b| format!("{:02x}", b)).collect();
                let path = peer.store.join(file);
                let value = match d.method {
                    DataMethod::Set => {
                        tokio::fs::write(&path, &d.value).await?;
                        Bytes::new()
                    }
                    DataMethod::Get => Bytes::from(tokio::fs::read(&path).await.unwrap_or_default()),
                    DataMethod::Delete => {
                        let _ = tokio::fs::remove_file(&path).await;
                        Bytes::new()
                    }
                };
                let reply = DataPacket::new(d.method, d.key.clone(), value).with_ack(true);
                conn.send(&Packet::Data(reply)).await?;
            }
            _ => {}
        }
        conn.shutdown().await?;
        Ok(())
    }

    /// Body of the peer executable written by
    /// `test_runner_against_scripted_peers`; a no-op anywhere else
    #[tokio::test]
    #[ignore = "launched as a peer process"]
    async fn scripted_peer() {
        let Ok(args) = std::env::var(PEER_ARGS_VAR) else {
            return;
        };
        let args: Vec<&str> = args.split_whitespace().collect();
        let flag = |name: &str| {
            args.iter()
                .position(|arg| *arg == name)
                .and_then(|i| args.get(i + 1))
                .copied()
        };

        let me = Node {
            id: flag("--self_id").map_or(0, |id| id.parse().unwrap()),
            ip: flag("--self_ip").unwrap().parse().unwrap(),
            port: flag("--self_port").unwrap().parse().unwrap(),
        };
        let listener = TcpListener::bind((me.ip, me.port)).await.unwrap();
        let peer = Arc::new(ScriptedPeer {
            me,
            store: PathBuf::from(std::env::var(PEER_STORE_VAR).unwrap()),
            ring: Mutex::new(Neighbours::default()),
        });

        if let (Some(ip), Some(port)) = (flag("--anch_ip"), flag("--anch_port")) {
            let anchor = Node {
                id: 0,
                ip: ip.parse().unwrap(),
                port: port.parse().unwrap(),
            };
            // The anchor may still be starting; the ring tests do not rely on it
            let _ = anchor.send(&me.control(ControlMethod::Join, 0)).await;
        }

        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(serve(peer.clone(), stream));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runner_against_scripted_peers() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        std::fs::create_dir(&store).unwrap();

        // The peer executable re-enters this test binary at `scripted_peer`
        let exe = std::env::current_exe().unwrap();
        let script = dir.path().join("peer");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nexport {}=\"$*\"\nexec '{}' suites::dht::tests::scripted_peer --exact --ignored --quiet\n",
                PEER_ARGS_VAR,
                exe.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = Config::default();
        config.general.build_dir = dir.path().to_path_buf();
        config
            .process
            .env
            .insert(PEER_STORE_VAR.to_string(), store.display().to_string());

        let mut registry = TestRegistry::new();
        registry.register("join_correct", |ctx| Box::pin(join_correct(ctx))).unwrap();
        registry.register("full_join", |ctx| Box::pin(full_join(ctx))).unwrap();
        registry.register("set_get_ring", |ctx| Box::pin(set_get_ring(ctx))).unwrap();

        let report = Runner::new(Arc::new(config), dir.path().to_path_buf())
            .run(&registry)
            .await;
        for case in &report.cases {
            assert!(case.passed, "{} failed: {:?}", case.name, case.error);
        }
        assert_eq!(report.passed(), 3);
        assert!(store.join("476f6f64205468696e6b696e6721").exists());
    }
}
