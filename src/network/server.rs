//! Mock TCP server
//!
//! Plays a ring neighbour of the peer under test: accepts connections,
//! captures one packet per connection into an inbox and, when scripted,
//! answers with a queued response.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::connection::{connect_and_send, Connection, ConnectionError};
use super::NetworkConfig;
use crate::protocol::{ControlPacket, DataPacket, Decoder, Packet, PacketKind};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Did not receive expected packet due to previous error in handler for {from}")]
    HandlerFailed {
        from: SocketAddr,
        #[source]
        source: ConnectionError,
    },

    #[error("Mock server received unexpected packet type. Expected {expected} got {found}")]
    UnexpectedPacket {
        expected: PacketKind,
        found: PacketKind,
    },
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Which packets a connection handler accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Control or data, dispatched on the type bit
    General,
    Control,
    Data,
}

impl HandlerKind {
    fn decoder(self, max_frame_len: usize) -> Decoder {
        let decoder = Decoder::new().with_max_frame_len(max_frame_len);
        match self {
            HandlerKind::General => decoder,
            HandlerKind::Control => decoder.expecting(PacketKind::Control),
            HandlerKind::Data => decoder.expecting(PacketKind::Data),
        }
    }
}

/// A scripted response
#[derive(Debug, Clone)]
pub enum Response {
    /// Reply on the connection the request arrived on
    Packet(Packet),
    /// Open a new connection to `host:port` and send the packet there
    Forward {
        packet: Packet,
        host: String,
        port: u16,
    },
}

impl From<Packet> for Response {
    fn from(packet: Packet) -> Self {
        Response::Packet(packet)
    }
}

impl From<ControlPacket> for Response {
    fn from(packet: ControlPacket) -> Self {
        Response::Packet(packet.into())
    }
}

impl From<DataPacket> for Response {
    fn from(packet: DataPacket) -> Self {
        Response::Packet(packet.into())
    }
}

impl<P, H> From<(P, H, u16)> for Response
where
    P: Into<Packet>,
    H: Into<String>,
{
    fn from((packet, host, port): (P, H, u16)) -> Self {
        Response::Forward {
            packet: packet.into(),
            host: host.into(),
            port,
        }
    }
}

/// An entry captured by a handler
#[derive(Debug)]
pub enum InboxItem {
    Packet { from: SocketAddr, packet: Packet },
    /// The handler failed before or after capturing a packet
    Failed {
        from: SocketAddr,
        error: ConnectionError,
    },
}

/// Multi-consumer queue of captured packets
#[derive(Debug)]
pub struct Inbox {
    tx: mpsc::UnboundedSender<InboxItem>,
    rx: Mutex<mpsc::UnboundedReceiver<InboxItem>>,
}

impl Inbox {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn push(&self, item: InboxItem) {
        // The receiver lives as long as `self`
        let _ = self.tx.send(item);
    }

    pub async fn pop(&self, timeout: Duration) -> Option<InboxItem> {
        tokio::time::timeout(timeout, async { self.rx.lock().await.recv().await })
            .await
            .ok()
            .flatten()
    }

    /// Pop the next item; `Ok(None)` if nothing arrived within `timeout`
    pub async fn await_packet(
        &self,
        expected: PacketKind,
        timeout: Duration,
    ) -> ServerResult<Option<Packet>> {
        match self.pop(timeout).await {
            None => Ok(None),
            Some(InboxItem::Failed { from, error }) => {
                Err(ServerError::HandlerFailed { from, source: error })
            }
            Some(InboxItem::Packet { packet, .. }) if packet.kind() == expected => Ok(Some(packet)),
            Some(InboxItem::Packet { packet, .. }) => Err(ServerError::UnexpectedPacket {
                expected,
                found: packet.kind(),
            }),
        }
    }
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Multi-producer, multi-consumer queue of scripted responses.
///
/// Each response is handed to at most one handler.
#[derive(Debug)]
pub struct ResponseQueue {
    tx: mpsc::UnboundedSender<Response>,
    rx: Mutex<mpsc::UnboundedReceiver<Response>>,
}

impl ResponseQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn push(&self, response: Response) {
        let _ = self.tx.send(response);
    }

    pub async fn pop(&self, wait: Duration) -> Option<Response> {
        tokio::time::timeout(wait, async { self.rx.lock().await.recv().await })
            .await
            .ok()
            .flatten()
    }
}

impl Default for ResponseQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared between the server handle and its handlers
pub(crate) struct Shared {
    pub(crate) config: NetworkConfig,
    pub(crate) inbox: Inbox,
    pub(crate) responses: ResponseQueue,
    pub(crate) auto_respond: AtomicBool,
}

impl Shared {
    pub(crate) fn new(config: NetworkConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inbox: Inbox::new(),
            responses: ResponseQueue::new(),
            auto_respond: AtomicBool::new(false),
        })
    }

    /// Pop the next scripted response, failing if none arrives in time
    pub(crate) async fn next_response(&self) -> Result<Response, ConnectionError> {
        let wait = self.config.response_wait;
        self.responses
            .pop(wait)
            .await
            .ok_or(ConnectionError::NoScriptedResponse(wait))
    }
}

/// Mock TCP peer
pub struct MockServer {
    local_addr: SocketAddr,
    kind: HandlerKind,
    shared: Arc<Shared>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MockServer {
    /// Bind `0.0.0.0:port` and start accepting connections
    pub async fn start(config: NetworkConfig, port: u16, kind: HandlerKind) -> ServerResult<Self> {
        let bind_addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Mock server ({:?}) listening on {}", kind, local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let shared = Shared::new(config);
        let handler_shared = shared.clone();

        // Spawn the accept loop
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::debug!("New connection from {}", addr);
                                let shared = handler_shared.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, kind, &shared).await {
                                        tracing::warn!("Handler error for {}: {}", addr, e);
                                        shared.inbox.push(InboxItem::Failed { from: addr, error: e });
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Mock server on {} shutting down", local_addr);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            kind,
            shared,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// Answer each captured packet with the next scripted response
    pub fn set_auto_respond(&self, enabled: bool) {
        self.shared.auto_respond.store(enabled, Ordering::SeqCst);
    }

    /// Queue a response: a packet for the same connection, or a
    /// `(packet, host, port)` triple for a fresh outbound connection
    pub fn enqueue_response(&self, response: impl Into<Response>) {
        self.shared.responses.push(response.into());
    }

    pub async fn await_packet(
        &self,
        expected: PacketKind,
        timeout: Duration,
    ) -> ServerResult<Option<Packet>> {
        self.shared.inbox.await_packet(expected, timeout).await
    }

    pub async fn await_control(&self, timeout: Duration) -> ServerResult<Option<ControlPacket>> {
        let packet = self.await_packet(PacketKind::Control, timeout).await?;
        Ok(packet.and_then(|p| match p {
            Packet::Control(c) => Some(c),
            _ => None,
        }))
    }

    pub async fn await_data(&self, timeout: Duration) -> ServerResult<Option<DataPacket>> {
        let packet = self.await_packet(PacketKind::Data, timeout).await?;
        Ok(packet.and_then(|p| match p {
            Packet::Data(d) => Some(d),
            _ => None,
        }))
    }

    /// Stop accepting and wait for the accept loop to exit. Idempotent.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

/// Handle a single connection: capture one packet, then respond if scripted
async fn handle_connection(
    stream: TcpStream,
    kind: HandlerKind,
    shared: &Shared,
) -> Result<(), ConnectionError> {
    let from = stream.peer_addr()?;
    let config = &shared.config;
    let mut conn = Connection::new(stream, config.frame_wait)
        .with_decoder(kind.decoder(config.max_frame_len));

    let packet = conn.recv().await?;
    tracing::debug!("Captured {} packet from {}", packet.kind(), from);
    shared.inbox.push(InboxItem::Packet { from, packet });

    if !shared.auto_respond.load(Ordering::SeqCst) {
        return Ok(());
    }

    if kind == HandlerKind::General {
        tokio::time::sleep(config.response_delay).await;
    }

    match shared.next_response().await? {
        Response::Packet(packet) => conn.send(&packet).await?,
        Response::Forward { packet, host, port } => {
            connect_and_send(&packet, &host, port, config.connect_timeout).await?
        }
    }

    Ok(())
}
