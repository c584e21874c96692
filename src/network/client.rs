//! Mock TCP client
//!
//! Connects to the peer under test, sends exactly one packet and collects the
//! reply until the peer closes the connection or goes idle.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::connection::{connect_timeout, Connection, ConnectionError};
use super::NetworkConfig;
use crate::protocol::{DecodeError, Packet, PacketKind};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Did not receive expected packet due to previous error: {0}")]
    Failed(#[source] ConnectionError),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Mock client for a single request/reply exchange
pub struct MockClient {
    addr: SocketAddr,
    connected_rx: watch::Receiver<bool>,
    replies: Mutex<mpsc::UnboundedReceiver<Result<Packet, ConnectionError>>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MockClient {
    /// Spawn the client task; it starts connecting immediately
    pub fn start(config: NetworkConfig, packet: Packet, addr: SocketAddr) -> Self {
        let (connected_tx, connected_rx) = watch::channel(false);
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let outcome = run(config, packet, addr, connected_tx, shutdown_rx).await;
            match outcome {
                Ok(Some(reply)) => {
                    let _ = reply_tx.send(Ok(reply));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Mock client to {} failed: {}", addr, e);
                    let _ = reply_tx.send(Err(e));
                }
            }
        });

        Self {
            addr,
            connected_rx,
            replies: Mutex::new(reply_rx),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait until the connection is established; false on timeout or if the
    /// client gave up connecting
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.connected_rx.clone();
        let connected = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|connected| *connected)).await,
            Ok(Ok(_))
        );
        connected
    }

    /// Wait for the parsed reply; `Ok(None)` if none arrived within `timeout`
    pub async fn await_packet(&self, timeout: Duration) -> ClientResult<Option<Packet>> {
        let reply = tokio::time::timeout(timeout, async { self.replies.lock().await.recv().await })
            .await
            .ok()
            .flatten();

        match reply {
            None => Ok(None),
            Some(Ok(packet)) => Ok(Some(packet)),
            Some(Err(e)) => Err(ClientError::Failed(e)),
        }
    }

    /// Unblock the read loop and wait for the task to finish. Idempotent.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.try_send(());
        }
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

async fn run(
    config: NetworkConfig,
    packet: Packet,
    addr: SocketAddr,
    connected_tx: watch::Sender<bool>,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> Result<Option<Packet>, ConnectionError> {
    let stream = tokio::select! {
        result = connect_timeout(addr, config.connect_timeout) => result?,
        _ = shutdown_rx.recv() => return Ok(None),
    };
    let _ = connected_tx.send(true);
    tracing::debug!("Mock client connected to {}", addr);

    let mut conn = Connection::new(stream, config.frame_wait);
    conn.send(&packet).await?;

    // No response expected for one-way control messages
    if let Packet::Control(control) = &packet {
        if !control.method.expects_reply() {
            conn.shutdown().await?;
            return Ok(None);
        }
    }

    let mut stream = conn.into_inner();
    let mut reply = BytesMut::new();
    let mut chunk = [0u8; 1024];
    loop {
        tokio::select! {
            read = tokio::time::timeout(config.client_idle, stream.read(&mut chunk)) => {
                match read {
                    Ok(Ok(0)) | Err(_) => break,
                    Ok(Ok(n)) => {
                        let total = reply.len() + n;
                        if total > config.max_frame_len {
                            return Err(DecodeError::FrameTooLarge(total as u64).into());
                        }
                        reply.extend_from_slice(&chunk[..n]);
                    }
                    Ok(Err(e)) => return Err(e.into()),
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("Mock client to {} stopped", addr);
                return Ok(None);
            }
        }
    }

    // The reply has the same type as the request
    let kind = match packet.kind() {
        PacketKind::Null => PacketKind::Data,
        kind => kind,
    };
    Ok(Some(Packet::parse_as(kind, &reply)?))
}
