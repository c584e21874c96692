//! Mock UDP server for NTP
//!
//! Each datagram is one packet, so no stream framing is involved.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::connection::{connect_and_send, ConnectionError};
use super::server::{InboxItem, Response, ServerError, ServerResult, Shared};
use super::NetworkConfig;
use crate::protocol::{NtpPacket, Packet, PacketKind};

/// Largest datagram accepted
const MAX_DATAGRAM: usize = 2048;

/// Mock NTP server
pub struct UdpMockServer {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpMockServer {
    /// Bind `0.0.0.0:port` and start receiving datagrams
    pub async fn start(config: NetworkConfig, port: u16) -> ServerResult<Self> {
        let bind_addr = format!("0.0.0.0:{}", port);
        let socket = UdpSocket::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;
        let socket = Arc::new(socket);

        let local_addr = socket.local_addr()?;
        tracing::info!("Mock NTP server listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let shared = Shared::new(config);
        let handler_shared = shared.clone();

        let task = tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    result = socket.recv_from(&mut buf) => {
                        match result {
                            Ok((n, from)) => {
                                let datagram = buf[..n].to_vec();
                                let socket = socket.clone();
                                let shared = handler_shared.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_datagram(&datagram, from, &socket, &shared).await {
                                        tracing::warn!("NTP handler error for {}: {}", from, e);
                                        shared.inbox.push(InboxItem::Failed { from, error: e });
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Receive error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Mock NTP server on {} shutting down", local_addr);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
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

    pub fn set_auto_respond(&self, enabled: bool) {
        self.shared.auto_respond.store(enabled, Ordering::SeqCst);
    }

    pub fn enqueue_response(&self, response: impl Into<Response>) {
        self.shared.responses.push(response.into());
    }

    pub async fn await_packet(&self, timeout: Duration) -> ServerResult<Option<NtpPacket>> {
        let packet = self.shared.inbox.await_packet(PacketKind::Ntp, timeout).await?;
        Ok(packet.and_then(|p| match p {
            Packet::Ntp(ntp) => Some(ntp),
            _ => None,
        }))
    }

    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

async fn handle_datagram(
    datagram: &[u8],
    from: SocketAddr,
    socket: &UdpSocket,
    shared: &Shared,
) -> Result<(), ConnectionError> {
    let packet = NtpPacket::parse(datagram)?;
    tracing::debug!("Captured NTP packet (mode {}) from {}", packet.mode, from);
    shared.inbox.push(InboxItem::Packet {
        from,
        packet: Packet::Ntp(packet),
    });

    if !shared.auto_respond.load(Ordering::SeqCst) {
        return Ok(());
    }

    match shared.next_response().await? {
        Response::Packet(packet) => {
            let bytes = packet.serialize()?;
            if !bytes.is_empty() {
                socket.send_to(&bytes, from).await?;
            }
        }
        Response::Forward { packet, host, port } => {
            connect_and_send(&packet, &host, port, shared.config.connect_timeout).await?
        }
    }

    Ok(())
}
