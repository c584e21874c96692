//! Packet definitions for the DHT control and key/value data protocols
//!
//! Both families share one stream; bit 7 of the first byte tells them apart.
//!
//! Control packet (11 bytes):
//! ```text
//! [flags:1][hash_id:2][node_id:2][node_ip:4][node_port:2]
//! ```
//!
//! Data packet (7 byte header + payload):
//! ```text
//! [flags:1][key_len:2][value_len:4][key][value]
//! ```

use std::fmt;
use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::ntp::NtpPacket;

/// Fixed wire length of a control packet
pub const CONTROL_PACKET_LEN: usize = 11;

/// Length of the data packet header preceding key and value
pub const DATA_HEADER_LEN: usize = 7;

/// Type discriminant: set for control packets, clear for data packets
pub const CONTROL_BIT: u8 = 1 << 7;

/// Set on a data packet acknowledging a request
pub const ACK_BIT: u8 = 1 << 3;

const DATA_METHOD_MASK: u8 = 0b0000_0111;
const CONTROL_METHOD_MASK: u8 = 0b0111_1111;

/// Decode errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unable to determine packet type of empty buffer")]
    EmptyBuffer,

    #[error("{kind} packet too short: expected {expected} bytes but got {got}")]
    Truncated {
        kind: PacketKind,
        expected: usize,
        got: usize,
    },

    #[error("Expected {expected} packet but got {found} packet")]
    UnexpectedKind {
        expected: PacketKind,
        found: PacketKind,
    },

    #[error("No method bit set in {0} packet")]
    NoMethod(PacketKind),

    #[error("Conflicting method bits set in {kind} packet: {flags:#010b}")]
    ConflictingMethods { kind: PacketKind, flags: u8 },

    #[error("Data packet declares {0} bytes, exceeding the frame limit")]
    FrameTooLarge(u64),
}

/// Encode errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Key too large: {0} bytes (max: {max})", max = u16::MAX)]
    KeyTooLarge(usize),

    #[error("Value too large: {0} bytes (max: {max})", max = u32::MAX)]
    ValueTooLarge(usize),
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// Discriminant over the packet families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Control,
    Data,
    Ntp,
    Null,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketKind::Control => "Control",
            PacketKind::Data => "Data",
            PacketKind::Ntp => "NTP",
            PacketKind::Null => "Null",
        };
        f.write_str(name)
    }
}

/// Determine whether a stream buffer carries a control or a data packet.
///
/// Only the high bit of the first byte is inspected, so a single byte is
/// enough.
pub fn packet_type(buf: &[u8]) -> DecodeResult<PacketKind> {
    match buf.first() {
        None => Err(DecodeError::EmptyBuffer),
        Some(flags) if flags & CONTROL_BIT != 0 => Ok(PacketKind::Control),
        Some(_) => Ok(PacketKind::Data),
    }
}

/// Ring maintenance methods, one flag bit each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlMethod {
    Lookup = 1 << 0,
    Reply = 1 << 1,
    Stabilize = 1 << 2,
    Notify = 1 << 3,
    Join = 1 << 4,
    Fack = 1 << 5,
    Finger = 1 << 6,
}

impl ControlMethod {
    pub const ALL: [ControlMethod; 7] = [
        ControlMethod::Lookup,
        ControlMethod::Reply,
        ControlMethod::Stabilize,
        ControlMethod::Notify,
        ControlMethod::Join,
        ControlMethod::Fack,
        ControlMethod::Finger,
    ];

    pub fn bit(self) -> u8 {
        self as u8
    }

    /// Extract the method from a flags byte; exactly one method bit must be set
    pub fn from_flags(flags: u8) -> DecodeResult<Self> {
        let bits = flags & CONTROL_METHOD_MASK;
        if bits == 0 {
            return Err(DecodeError::NoMethod(PacketKind::Control));
        }
        if bits.count_ones() > 1 {
            return Err(DecodeError::ConflictingMethods {
                kind: PacketKind::Control,
                flags,
            });
        }
        Self::ALL
            .into_iter()
            .find(|m| m.bit() == bits)
            .ok_or(DecodeError::NoMethod(PacketKind::Control))
    }

    /// LOOKUP, REPLY and JOIN are fire-and-forget; the receiver answers, if at
    /// all, on a connection of its own.
    pub fn expects_reply(self) -> bool {
        !matches!(
            self,
            ControlMethod::Lookup | ControlMethod::Reply | ControlMethod::Join
        )
    }
}

impl fmt::Display for ControlMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlMethod::Lookup => "LOOKUP",
            ControlMethod::Reply => "REPLY",
            ControlMethod::Stabilize => "STABILIZE",
            ControlMethod::Notify => "NOTIFY",
            ControlMethod::Join => "JOIN",
            ControlMethod::Fack => "FACK",
            ControlMethod::Finger => "FINGER",
        };
        f.write_str(name)
    }
}

/// Key/value request methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataMethod {
    Delete = 1 << 0,
    Set = 1 << 1,
    Get = 1 << 2,
}

impl DataMethod {
    pub fn bit(self) -> u8 {
        self as u8
    }

    pub fn from_flags(flags: u8) -> DecodeResult<Self> {
        match flags & DATA_METHOD_MASK {
            0 => Err(DecodeError::NoMethod(PacketKind::Data)),
            b if b == DataMethod::Delete.bit() => Ok(DataMethod::Delete),
            b if b == DataMethod::Set.bit() => Ok(DataMethod::Set),
            b if b == DataMethod::Get.bit() => Ok(DataMethod::Get),
            _ => Err(DecodeError::ConflictingMethods {
                kind: PacketKind::Data,
                flags,
            }),
        }
    }
}

impl fmt::Display for DataMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataMethod::Get => "GET",
            DataMethod::Set => "SET",
            DataMethod::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Ring maintenance message
#[derive(Debug, Clone)]
pub struct ControlPacket {
    pub method: ControlMethod,
    pub hash_id: u16,
    pub node_id: u16,
    pub ip: Ipv4Addr,
    pub port: u16,
    /// Source bytes when produced by [`ControlPacket::parse`]
    pub raw: Option<Bytes>,
}

// `raw` is diagnostic only and does not take part in equality.
impl PartialEq for ControlPacket {
    fn eq(&self, other: &Self) -> bool {
        self.method == other.method
            && self.hash_id == other.hash_id
            && self.node_id == other.node_id
            && self.ip == other.ip
            && self.port == other.port
    }
}

impl Eq for ControlPacket {}

impl ControlPacket {
    pub fn new(method: ControlMethod, hash_id: u16, node_id: u16, ip: Ipv4Addr, port: u16) -> Self {
        Self {
            method,
            hash_id,
            node_id,
            ip,
            port,
            raw: None,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(CONTROL_PACKET_LEN);
        buf.put_u8(CONTROL_BIT | self.method.bit());
        buf.put_u16(self.hash_id);
        buf.put_u16(self.node_id);
        buf.put_slice(&self.ip.octets());
        buf.put_u16(self.port);
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CONTROL_PACKET_LEN);
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn parse(buf: &[u8]) -> DecodeResult<Self> {
        if buf.len() < CONTROL_PACKET_LEN {
            return Err(DecodeError::Truncated {
                kind: PacketKind::Control,
                expected: CONTROL_PACKET_LEN,
                got: buf.len(),
            });
        }

        let mut cursor = &buf[..CONTROL_PACKET_LEN];
        let flags = cursor.get_u8();
        if flags & CONTROL_BIT == 0 {
            return Err(DecodeError::UnexpectedKind {
                expected: PacketKind::Control,
                found: PacketKind::Data,
            });
        }

        let method = ControlMethod::from_flags(flags)?;
        let hash_id = cursor.get_u16();
        let node_id = cursor.get_u16();
        let ip = Ipv4Addr::from(cursor.get_u32());
        let port = cursor.get_u16();

        Ok(Self {
            method,
            hash_id,
            node_id,
            ip,
            port,
            raw: Some(Bytes::copy_from_slice(buf)),
        })
    }
}

/// Key/value request or response
#[derive(Debug, Clone)]
pub struct DataPacket {
    pub method: DataMethod,
    pub ack: bool,
    pub key: Bytes,
    pub value: Bytes,
    pub raw: Option<Bytes>,
}

impl PartialEq for DataPacket {
    fn eq(&self, other: &Self) -> bool {
        self.method == other.method
            && self.ack == other.ack
            && self.key == other.key
            && self.value == other.value
    }
}

impl Eq for DataPacket {}

impl DataPacket {
    pub fn new(method: DataMethod, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            method,
            ack: false,
            key: key.into(),
            value: value.into(),
            raw: None,
        }
    }

    pub fn get(key: impl Into<Bytes>) -> Self {
        Self::new(DataMethod::Get, key, Bytes::new())
    }

    pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(DataMethod::Set, key, value)
    }

    pub fn delete(key: impl Into<Bytes>) -> Self {
        Self::new(DataMethod::Delete, key, Bytes::new())
    }

    pub fn with_ack(mut self, ack: bool) -> Self {
        self.ack = ack;
        self
    }

    /// Total length on the wire
    pub fn wire_len(&self) -> usize {
        DATA_HEADER_LEN + self.key.len() + self.value.len()
    }

    /// Frame length for the given header fields. Summed in `u64` so a
    /// declared length never wraps on 32-bit targets.
    pub fn frame_len(key_len: u16, value_len: u32) -> DecodeResult<usize> {
        let total = DATA_HEADER_LEN as u64 + u64::from(key_len) + u64::from(value_len);
        usize::try_from(total).map_err(|_| DecodeError::FrameTooLarge(total))
    }

    /// Decode `(key_len, value_len)` from a data packet header
    pub fn len_from_header(buf: &[u8]) -> DecodeResult<(u16, u32)> {
        if buf.len() < DATA_HEADER_LEN {
            return Err(DecodeError::Truncated {
                kind: PacketKind::Data,
                expected: DATA_HEADER_LEN,
                got: buf.len(),
            });
        }

        let mut cursor = &buf[..DATA_HEADER_LEN];
        let flags = cursor.get_u8();
        if flags & CONTROL_BIT != 0 {
            return Err(DecodeError::UnexpectedKind {
                expected: PacketKind::Data,
                found: PacketKind::Control,
            });
        }

        let key_len = cursor.get_u16();
        let value_len = cursor.get_u32();
        Ok((key_len, value_len))
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let key_len =
            u16::try_from(self.key.len()).map_err(|_| EncodeError::KeyTooLarge(self.key.len()))?;
        let value_len = u32::try_from(self.value.len())
            .map_err(|_| EncodeError::ValueTooLarge(self.value.len()))?;

        let mut flags = self.method.bit();
        if self.ack {
            flags |= ACK_BIT;
        }

        buf.reserve(self.wire_len());
        buf.put_u8(flags);
        buf.put_u16(key_len);
        buf.put_u32(value_len);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
        Ok(())
    }

    pub fn serialize(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn parse(buf: &[u8]) -> DecodeResult<Self> {
        let (key_len, value_len) = Self::len_from_header(buf)?;
        let total = Self::frame_len(key_len, value_len)?;
        let key_end = DATA_HEADER_LEN + key_len as usize;

        if buf.len() < total {
            return Err(DecodeError::Truncated {
                kind: PacketKind::Data,
                expected: total,
                got: buf.len(),
            });
        }

        let flags = buf[0];
        let method = DataMethod::from_flags(flags)?;

        Ok(Self {
            method,
            ack: flags & ACK_BIT != 0,
            key: Bytes::copy_from_slice(&buf[DATA_HEADER_LEN..key_end]),
            value: Bytes::copy_from_slice(&buf[key_end..total]),
            raw: Some(Bytes::copy_from_slice(buf)),
        })
    }
}

/// Any packet the bench sends or recognizes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Control(ControlPacket),
    Data(DataPacket),
    Ntp(NtpPacket),
    /// Serializes to nothing; scripts "send no response"
    Null,
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Control(_) => PacketKind::Control,
            Packet::Data(_) => PacketKind::Data,
            Packet::Ntp(_) => PacketKind::Ntp,
            Packet::Null => PacketKind::Null,
        }
    }

    pub fn serialize(&self) -> Result<Bytes, EncodeError> {
        match self {
            Packet::Control(p) => Ok(p.serialize()),
            Packet::Data(p) => p.serialize(),
            Packet::Ntp(p) => Ok(p.serialize()),
            Packet::Null => Ok(Bytes::new()),
        }
    }

    /// Parse a stream packet, dispatching on the type bit
    pub fn parse(buf: &[u8]) -> DecodeResult<Self> {
        let kind = packet_type(buf)?;
        Self::parse_as(kind, buf)
    }

    /// Parse `buf` as a specific packet family
    pub fn parse_as(kind: PacketKind, buf: &[u8]) -> DecodeResult<Self> {
        match kind {
            PacketKind::Control => ControlPacket::parse(buf).map(Packet::Control),
            PacketKind::Data => DataPacket::parse(buf).map(Packet::Data),
            PacketKind::Ntp => NtpPacket::parse(buf).map(Packet::Ntp),
            PacketKind::Null => Ok(Packet::Null),
        }
    }

    pub fn as_control(&self) -> Option<&ControlPacket> {
        match self {
            Packet::Control(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&DataPacket> {
        match self {
            Packet::Data(p) => Some(p),
            _ => None,
        }
    }
}

impl From<ControlPacket> for Packet {
    fn from(p: ControlPacket) -> Self {
        Packet::Control(p)
    }
}

impl From<DataPacket> for Packet {
    fn from(p: DataPacket) -> Self {
        Packet::Data(p)
    }
}

impl From<NtpPacket> for Packet {
    fn from(p: NtpPacket) -> Self {
        Packet::Ntp(p)
    }
}
