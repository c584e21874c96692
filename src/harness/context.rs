//! Per-test context
//!
//! Everything a test starts through the context is registered on the
//! teardown stack, so a failing test still leaves no sockets or processes
//! behind.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;

use super::teardown::{Teardown, TeardownStack};
use crate::config::Config;
use crate::network::{HandlerKind, MockClient, MockServer, NetworkConfig, UdpMockServer};
use crate::process::{CommandSpec, Supervisor};
use crate::protocol::Packet;

/// Pause between connection attempts of a mock client
const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Peers launched by [`TestContext::setup_student_ring`]
pub struct Ring {
    pub peers: Vec<Arc<Supervisor>>,
    pub ports: Vec<u16>,
}

/// How long a ring of `nodes` peers gets to stabilize
pub fn ring_settle(nodes: usize) -> Duration {
    Duration::from_secs(2) * nodes as u32 + Duration::from_millis(500)
}

pub struct TestContext {
    config: Arc<Config>,
    build_dir: PathBuf,
    network: NetworkConfig,
    teardown: Arc<TeardownStack>,
}

impl TestContext {
    pub fn new(config: Arc<Config>, build_dir: PathBuf, teardown: Arc<TeardownStack>) -> Self {
        let network = NetworkConfig::from_config(&config);
        Self {
            config,
            build_dir,
            network,
            teardown,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Path of an executable inside the build directory
    pub fn which(&self, name: &str) -> PathBuf {
        self.build_dir.join(name)
    }

    /// Register a resource for teardown after the test
    pub async fn defer(&self, entry: Arc<dyn Teardown>) {
        self.teardown.push(entry).await;
    }

    /// Start a mock TCP peer on `port`
    pub async fn start_peer(&self, port: u16, kind: HandlerKind) -> anyhow::Result<Arc<MockServer>> {
        let server = MockServer::start(self.network.clone(), port, kind)
            .await
            .with_context(|| format!("Could not setup mock peer on port {}", port))?;
        let server = Arc::new(server);
        self.defer(server.clone()).await;
        Ok(server)
    }

    /// Start a mock NTP peer on `port`
    pub async fn start_udp_peer(&self, port: u16) -> anyhow::Result<Arc<UdpMockServer>> {
        let server = UdpMockServer::start(self.network.clone(), port)
            .await
            .with_context(|| format!("Could not setup mock NTP peer on port {}", port))?;
        let server = Arc::new(server);
        self.defer(server.clone()).await;
        Ok(server)
    }

    /// Send `packet` to the peer listening on `port`.
    ///
    /// Connection attempts are repeated while the peer is still starting up,
    /// bounded by the server-ready timeout.
    pub async fn start_client(
        &self,
        packet: impl Into<Packet>,
        port: u16,
    ) -> anyhow::Result<Arc<MockClient>> {
        let packet = packet.into();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let deadline = Instant::now() + self.config.timeouts.server_ready();

        loop {
            let client = Arc::new(MockClient::start(self.network.clone(), packet.clone(), addr));
            if client.wait_connected(self.network.connect_timeout).await {
                self.defer(client.clone()).await;
                return Ok(client);
            }
            client.stop().await;

            if Instant::now() >= deadline {
                anyhow::bail!("Could not connect to peer on port {}", port);
            }
            tokio::time::sleep(CONNECT_RETRY).await;
        }
    }

    /// Launch the peer executable under test
    pub async fn start_student_peer(
        &self,
        port: u16,
        node_id: Option<u16>,
        anchor: Option<SocketAddrV4>,
        self_ip: Ipv4Addr,
    ) -> anyhow::Result<Arc<Supervisor>> {
        self.launch_peer(port, node_id, anchor, self_ip, self.config.timeouts.process())
            .await
    }

    /// Launch a ring on consecutive ports starting at `port_base`. The first
    /// peer creates the ring, the others join through it.
    pub async fn setup_student_ring(
        &self,
        node_ids: &[u16],
        port_base: u16,
        ignore_first_id: bool,
    ) -> anyhow::Result<Ring> {
        // Peers must outlive the settle time
        let timeout = self.config.timeouts.process() + ring_settle(node_ids.len());
        let first = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port_base);

        let mut ring = Ring {
            peers: Vec::with_capacity(node_ids.len()),
            ports: Vec::with_capacity(node_ids.len()),
        };
        for (i, &node_id) in node_ids.iter().enumerate() {
            let port = port_base + i as u16;
            let peer = if i == 0 {
                let id = if ignore_first_id { None } else { Some(node_id) };
                self.launch_peer(port, id, None, Ipv4Addr::LOCALHOST, timeout).await?
            } else {
                self.launch_peer(port, Some(node_id), Some(first), Ipv4Addr::LOCALHOST, timeout)
                    .await?
            };
            ring.peers.push(peer);
            ring.ports.push(port);
        }
        Ok(ring)
    }

    async fn launch_peer(
        &self,
        port: u16,
        node_id: Option<u16>,
        anchor: Option<SocketAddrV4>,
        self_ip: Ipv4Addr,
        timeout: Duration,
    ) -> anyhow::Result<Arc<Supervisor>> {
        let mut spec = CommandSpec::new(self.which(&self.config.general.peer_executable))
            .args(["--self_ip".to_string(), self_ip.to_string()])
            .args(["--self_port".to_string(), port.to_string()]);
        if let Some(id) = node_id {
            spec = spec.args(["--self_id".to_string(), id.to_string()]);
        }
        if let Some(anchor) = anchor {
            spec = spec
                .args(["--anch_ip".to_string(), anchor.ip().to_string()])
                .args(["--anch_port".to_string(), anchor.port().to_string()]);
        }
        let spec = spec
            .envs(&self.config.process.env)
            .verbose(self.config.process.verbose_flag);

        tracing::info!("Test command:\n\t {}", spec);
        let supervisor = Supervisor::launch(spec, timeout, self.config.timeouts.teardown())
            .await
            .context("Could not launch peer")?;
        let supervisor = Arc::new(supervisor);
        self.defer(supervisor.clone()).await;
        Ok(supervisor)
    }
}

/// Stop the given peers and join their output into one diagnostic string
pub async fn collect_trace(peers: &[Arc<Supervisor>]) -> String {
    let mut traces = Vec::with_capacity(peers.len());
    for (i, peer) in peers.iter().enumerate() {
        peer.stop().await;
        let trace = match peer.collect().await {
            Ok(outcome) => format!(
                "Stdout{}: {} // Stderr{}: {}",
                i,
                outcome.stdout_lossy(),
                i,
                outcome.stderr_lossy()
            ),
            Err(e) => format!("Stdout{} // Stderr{}: unavailable ({})", i, i, e),
        };
        traces.push(trace);
    }
    traces.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ControlMethod, ControlPacket};

    fn context(config: Config) -> (TestContext, Arc<TeardownStack>) {
        let stack = Arc::new(TeardownStack::new());
        let build_dir = config.general.build_dir.clone();
        (TestContext::new(Arc::new(config), build_dir, stack.clone()), stack)
    }

    #[test]
    fn test_ring_settle() {
        assert_eq!(ring_settle(4), Duration::from_millis(8500));
    }

    #[test]
    fn test_which_uses_build_dir() {
        let mut config = Config::default();
        config.general.build_dir = PathBuf::from("/tmp/out");
        let (ctx, _) = context(config);
        assert_eq!(ctx.which("peer"), PathBuf::from("/tmp/out/peer"));
    }

    #[tokio::test]
    async fn test_started_endpoints_are_torn_down() {
        let (ctx, stack) = context(Config::default());
        let server = ctx.start_peer(0, HandlerKind::Control).await.unwrap();
        let join = ControlPacket::new(ControlMethod::Join, 0, 7, Ipv4Addr::LOCALHOST, 1);
        ctx.start_client(join.clone(), server.port()).await.unwrap();
        assert_eq!(stack.len().await, 2);

        let captured = server.await_control(Duration::from_secs(2)).await.unwrap();
        assert_eq!(captured, Some(join));

        stack.run(false).await;
        assert_eq!(stack.len().await, 0);
    }

    #[tokio::test]
    async fn test_udp_peer_is_torn_down() {
        let (ctx, stack) = context(Config::default());
        let server = ctx.start_udp_peer(0).await.unwrap();
        assert_ne!(server.port(), 0);
        assert_eq!(stack.len().await, 1);
        stack.run(true).await;
    }

    #[tokio::test]
    async fn test_client_gives_up_on_closed_port() {
        let mut config = Config::default();
        config.timeouts.server_ready_ms = 300;
        let (ctx, stack) = context(config);
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let join = ControlPacket::new(ControlMethod::Join, 0, 7, Ipv4Addr::LOCALHOST, 1);
        let err = ctx.start_client(join, port).await.err().expect("nothing listens on the port");
        assert_eq!(err.to_string(), format!("Could not connect to peer on port {}", port));
        assert_eq!(stack.len().await, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_peer_arguments() {
        // An absolute executable name replaces the build directory
        let mut config = Config::default();
        config.general.peer_executable = "/bin/echo".to_string();
        let (ctx, stack) = context(config);

        let anchor = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1400);
        let peer = ctx
            .start_student_peer(2000, Some(42), Some(anchor), Ipv4Addr::LOCALHOST)
            .await
            .unwrap();
        let outcome = peer.collect().await.unwrap();
        assert_eq!(
            outcome.stdout_lossy(),
            "--self_ip 127.0.0.1 --self_port 2000 --self_id 42 --anch_ip 127.0.0.1 --anch_port 1400 --verbose\n"
        );

        let trace = collect_trace(&[peer]).await;
        assert!(trace.starts_with("Stdout0: --self_ip"));
        stack.run(false).await;
    }
}
