//! Stream frame decoder
//!
//! The wire carries no boundary markers. A frame's length is implied by its
//! first byte (control vs. data) and, for data packets, by the 7 byte header.
//! The decoder tracks which of those stages it is in and reports how many
//! more bytes it needs, so callers never read past the end of a frame.

use bytes::BytesMut;

use super::packet::{
    packet_type, ControlPacket, DataPacket, DecodeError, Packet, PacketKind, CONTROL_PACKET_LEN,
    DATA_HEADER_LEN,
};

/// Default upper bound on a single data frame (16 MB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Decodes control and data packets from a byte stream
#[derive(Debug)]
pub struct Decoder {
    state: DecodeState,
    expected: Option<PacketKind>,
    max_frame_len: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for the byte carrying the type bit
    #[default]
    Type,
    Control,
    DataHeader,
    DataBody {
        total: usize,
    },
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Type,
            expected: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Only accept frames of `kind`; others fail with `UnexpectedKind`
    pub fn expecting(mut self, kind: PacketKind) -> Self {
        self.expected = Some(kind);
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Total frame length known so far: 1 before the type byte, the header
    /// length before a data header is complete, the full length afterwards.
    pub fn target_len(&self) -> usize {
        match self.state {
            DecodeState::Type => 1,
            DecodeState::Control => CONTROL_PACKET_LEN,
            DecodeState::DataHeader => DATA_HEADER_LEN,
            DecodeState::DataBody { total } => total,
        }
    }

    /// Bytes still missing given `buffered` bytes of the current frame
    pub fn needed(&self, buffered: usize) -> usize {
        self.target_len().saturating_sub(buffered)
    }

    /// Attempt to decode a packet from the buffer.
    /// Returns Ok(None) if more data is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, DecodeError> {
        loop {
            match self.state {
                DecodeState::Type => {
                    if buf.is_empty() {
                        return Ok(None);
                    }

                    let kind = packet_type(&buf[..1])?;
                    if let Some(expected) = self.expected {
                        if expected != kind {
                            return Err(DecodeError::UnexpectedKind {
                                expected,
                                found: kind,
                            });
                        }
                    }

                    self.state = match kind {
                        PacketKind::Control => DecodeState::Control,
                        _ => DecodeState::DataHeader,
                    };
                }
                DecodeState::Control => {
                    if buf.len() < CONTROL_PACKET_LEN {
                        return Ok(None);
                    }

                    let frame = buf.split_to(CONTROL_PACKET_LEN);
                    self.state = DecodeState::Type;
                    return ControlPacket::parse(&frame).map(|p| Some(Packet::Control(p)));
                }
                DecodeState::DataHeader => {
                    if buf.len() < DATA_HEADER_LEN {
                        return Ok(None);
                    }

                    let (key_len, value_len) = DataPacket::len_from_header(buf)?;
                    let total = DataPacket::frame_len(key_len, value_len)?;
                    if total > self.max_frame_len {
                        return Err(DecodeError::FrameTooLarge(total as u64));
                    }

                    self.state = DecodeState::DataBody { total };
                }
                DecodeState::DataBody { total } => {
                    if buf.len() < total {
                        return Ok(None);
                    }

                    let frame = buf.split_to(total);
                    self.state = DecodeState::Type;
                    return DataPacket::parse(&frame).map(|p| Some(Packet::Data(p)));
                }
            }
        }
    }

}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
