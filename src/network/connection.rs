//! Connection handling for mock endpoints
//!
//! Turns a byte stream into discrete packets. Every read is bounded by the
//! frame wait, so a silent or hung peer yields an error instead of a hang.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};

use crate::protocol::{DecodeError, Decoder, EncodeError, Packet};

/// Read chunk upper bound
const READ_CHUNK: usize = 4096;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Peer sent nothing for {waited:?} ({received} of {expected} bytes received)")]
    FramingTimeout {
        waited: Duration,
        received: usize,
        expected: usize,
    },

    #[error("Peer closed connection after {received} of {expected} bytes")]
    IncompletePacket { received: usize, expected: usize },

    #[error("Host {host} did not resolve to any address")]
    Unresolved { host: String },

    #[error("Connecting to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },

    #[error("Expected a scripted response in queue but none arrived within {0:?}")]
    NoScriptedResponse(Duration),
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// A framed connection to the peer under test
pub struct Connection<S = TcpStream> {
    stream: S,
    decoder: Decoder,
    read_buf: BytesMut,
    frame_wait: Duration,
    stats: ConnectionStats,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, frame_wait: Duration) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            frame_wait,
            stats: ConnectionStats::default(),
        }
    }

    /// Replace the decoder, e.g. to restrict the accepted packet kind
    pub fn with_decoder(mut self, decoder: Decoder) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Receive exactly one packet.
    ///
    /// Reads never go past the end of the current frame, so bytes following
    /// it stay in the socket for the next call.
    pub async fn recv(&mut self) -> ConnectionResult<Packet> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(packet) = self.decoder.decode(&mut self.read_buf)? {
                self.stats.packets_received += 1;
                tracing::debug!("Received {} packet", packet.kind());
                return Ok(packet);
            }

            let need = self.decoder.needed(self.read_buf.len()).clamp(1, READ_CHUNK);
            let read = tokio::time::timeout(self.frame_wait, self.stream.read(&mut chunk[..need]));
            let n = match read.await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(ConnectionError::FramingTimeout {
                        waited: self.frame_wait,
                        received: self.read_buf.len(),
                        expected: self.decoder.target_len(),
                    });
                }
            };

            if n == 0 {
                return Err(ConnectionError::IncompletePacket {
                    received: self.read_buf.len(),
                    expected: self.decoder.target_len(),
                });
            }

            self.read_buf.extend_from_slice(&chunk[..n]);
            self.stats.bytes_received += n as u64;
        }
    }

    /// Send a packet. A null packet writes nothing.
    pub async fn send(&mut self, packet: &Packet) -> ConnectionResult<()> {
        let bytes = packet.serialize()?;
        if bytes.is_empty() {
            return Ok(());
        }

        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes.len() as u64;
        tracing::debug!("Sent {} packet ({} bytes)", packet.kind(), bytes.len());
        Ok(())
    }

    /// Close the write half
    pub async fn shutdown(&mut self) -> ConnectionResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// Connect with a bound on how long the handshake may take
pub async fn connect_timeout(addr: SocketAddr, timeout: Duration) -> ConnectionResult<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ConnectionError::Io(e)),
        Err(_) => Err(ConnectionError::ConnectTimeout { addr, timeout }),
    }
}

/// First address `host:port` resolves to
pub async fn resolve(host: &str, port: u16) -> ConnectionResult<SocketAddr> {
    lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| ConnectionError::Unresolved {
            host: host.to_string(),
        })
}

/// Open a fresh connection to `host:port`, send `packet`, and close it
pub async fn connect_and_send(
    packet: &Packet,
    host: &str,
    port: u16,
    timeout: Duration,
) -> ConnectionResult<()> {
    let addr = resolve(host, port).await?;
    tracing::debug!("Sending {} packet to {}", packet.kind(), addr);

    let stream = connect_timeout(addr, timeout).await?;
    let mut conn = Connection::new(stream, timeout);
    conn.send(packet).await?;
    conn.shutdown().await?;

    tracing::debug!("Sent successfully to {}", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ControlMethod, ControlPacket, DataPacket, PacketKind};
    use std::net::Ipv4Addr;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_reassembles_single_byte_fragments() {
        let original = DataPacket::set(&b"Good Thinking!"[..], &b"You have invited all my friends!"[..]);
        let bytes = original.serialize().unwrap();

        let mut builder = Builder::new();
        for b in bytes.iter() {
            builder.read(&[*b]).wait(Duration::from_millis(5));
        }
        let mock = builder.build();

        let mut conn = Connection::new(mock, Duration::from_millis(500));
        let packet = conn.recv().await.unwrap();
        assert_eq!(packet, Packet::Data(original));
        assert_eq!(conn.stats().bytes_received, bytes.len() as u64);
    }

    #[tokio::test]
    async fn test_does_not_read_past_frame() {
        let first = ControlPacket::new(ControlMethod::Join, 0, 42, Ipv4Addr::LOCALHOST, 1401);
        let second = DataPacket::get(&b"key"[..]);
        let mut bytes = first.serialize().to_vec();
        bytes.extend_from_slice(&second.serialize().unwrap());

        let mock = Builder::new().read(&bytes).build();
        let mut conn = Connection::new(mock, Duration::from_millis(500));

        assert_eq!(conn.recv().await.unwrap(), Packet::Control(first));
        assert_eq!(conn.recv().await.unwrap(), Packet::Data(second));
    }

    #[tokio::test]
    async fn test_eof_inside_header_fails_fast() {
        let bytes = DataPacket::set(&b"key"[..], &b"value"[..]).serialize().unwrap();
        let mock = Builder::new().read(&bytes[..5]).build();
        let mut conn = Connection::new(mock, Duration::from_millis(500));

        let err = conn.recv().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::IncompletePacket { received: 5, expected: 7 }
        ));
    }

    #[tokio::test]
    async fn test_eof_one_byte_short_of_body() {
        let bytes = DataPacket::set(&b"key"[..], &b"value"[..]).serialize().unwrap();
        let mock = Builder::new().read(&bytes[..bytes.len() - 1]).build();
        let mut conn = Connection::new(mock, Duration::from_millis(500));

        let err = conn.recv().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::IncompletePacket { received: 14, expected: 15 }
        ));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (client, _server) = tokio::io::duplex(64);
        let mut conn = Connection::new(client, Duration::from_millis(50));

        let err = conn.recv().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::FramingTimeout { received: 0, expected: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_stall_mid_frame_times_out() {
        let (client, mut server) = tokio::io::duplex(64);
        let bytes = ControlPacket::new(ControlMethod::Notify, 0, 1, Ipv4Addr::LOCALHOST, 1)
            .serialize();
        server.write_all(&bytes[..4]).await.unwrap();

        let mut conn = Connection::new(client, Duration::from_millis(50));
        let err = conn.recv().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::FramingTimeout { received: 4, expected: 11, .. }
        ));
    }

    #[tokio::test]
    async fn test_restricted_decoder_rejects_other_kind() {
        let bytes = DataPacket::get(&b"k"[..]).serialize().unwrap();
        let mock = Builder::new().read(&bytes[..1]).build();
        let mut conn = Connection::new(mock, Duration::from_millis(500))
            .with_decoder(Decoder::new().expecting(PacketKind::Control));

        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Decode(DecodeError::UnexpectedKind { .. })));
    }

    #[tokio::test]
    async fn test_null_packet_sends_nothing() {
        let mock = Builder::new().build();
        let mut conn = Connection::new(mock, Duration::from_millis(500));
        conn.send(&Packet::Null).await.unwrap();
        assert_eq!(conn.stats().packets_sent, 0);
    }

    #[tokio::test]
    async fn test_connect_and_send_delivers_one_frame() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_eq!(
            resolve("127.0.0.1", port).await.unwrap(),
            SocketAddr::from((Ipv4Addr::LOCALHOST, port))
        );

        let notify = ControlPacket::new(ControlMethod::Notify, 0, 100, Ipv4Addr::LOCALHOST, 1400);
        let packet = Packet::from(notify.clone());
        let send = connect_and_send(&packet, "127.0.0.1", port, Duration::from_secs(1));
        let (sent, accepted) = tokio::join!(send, listener.accept());
        sent.unwrap();

        let (mut stream, _) = accepted.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, notify.serialize().to_vec());
    }
}
