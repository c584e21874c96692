//! NTP packet format (RFC 5905 header, no extension fields)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |LI | VN  |Mode |    Stratum    |     Poll      |   Precision   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Root Delay / Root Dispersion                  |
//! |                         Reference ID                          |
//! |            Reference / Origin / Receive / Transmit            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::packet::{DecodeError, DecodeResult, PacketKind};

/// Fixed wire length of an NTP packet
pub const NTP_PACKET_LEN: usize = 48;

const FRACTION_SCALE: f64 = 4_294_967_296.0; // 2^32

/// NTP short format, 16.16 fixed point
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct NtpShort {
    pub seconds: u16,
    pub fraction: u16,
}

impl NtpShort {
    pub fn new(seconds: u16, fraction: u16) -> Self {
        Self { seconds, fraction }
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u16(self.seconds);
        buf.put_u16(self.fraction);
    }

    fn get(cursor: &mut &[u8]) -> Self {
        Self {
            seconds: cursor.get_u16(),
            fraction: cursor.get_u16(),
        }
    }
}

/// NTP timestamp format, 32.32 fixed point counted from 1900-01-01
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    /// Seconds between 1900-01-01 and 1970-01-01
    pub const UNIX_EPOCH_OFFSET: u64 = 2_208_988_800;

    pub fn new(seconds: u32, fraction: u32) -> Self {
        Self { seconds, fraction }
    }

    /// Seconds since the Unix epoch, including the fractional part
    pub fn to_unix_seconds(&self) -> f64 {
        (self.seconds as f64 - Self::UNIX_EPOCH_OFFSET as f64)
            + self.fraction as f64 / FRACTION_SCALE
    }

    /// Inverse of [`NtpTimestamp::to_unix_seconds`]; the fraction is truncated.
    /// Seconds wrap into the current NTP era.
    pub fn from_unix(ts: f64) -> Self {
        let whole = ts.floor();
        let fraction = ((ts - whole) * FRACTION_SCALE) as u32;
        let seconds = (whole as i64 + Self::UNIX_EPOCH_OFFSET as i64) as u32;
        Self { seconds, fraction }
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let ts = match time.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs_f64(),
            Err(e) => -e.duration().as_secs_f64(),
        };
        Self::from_unix(ts)
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.seconds);
        buf.put_u32(self.fraction);
    }

    fn get(cursor: &mut &[u8]) -> Self {
        Self {
            seconds: cursor.get_u32(),
            fraction: cursor.get_u32(),
        }
    }
}

/// A single NTP header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtpPacket {
    /// Leap indicator, 2 bits
    pub li: u8,
    /// Version number, 3 bits
    pub version: u8,
    /// Association mode, 3 bits
    pub mode: u8,
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: NtpShort,
    pub root_dispersion: NtpShort,
    pub reference_id: [u8; 4],
    pub reference_ts: NtpTimestamp,
    pub origin_ts: NtpTimestamp,
    pub receive_ts: NtpTimestamp,
    pub transmit_ts: NtpTimestamp,
}

impl NtpPacket {
    pub const MODE_CLIENT: u8 = 3;
    pub const MODE_SERVER: u8 = 4;

    /// Stratum 1 server answer received at `receive` and sent `delta` later
    pub fn server_reply(
        receive: SystemTime,
        delta: Duration,
        root_dispersion: Option<NtpShort>,
    ) -> Self {
        Self {
            li: 0,
            version: 4,
            mode: Self::MODE_SERVER,
            stratum: 1,
            poll: 0,
            precision: 0,
            root_delay: NtpShort::default(),
            root_dispersion: root_dispersion.unwrap_or_default(),
            reference_id: *b"XCOM",
            reference_ts: NtpTimestamp::default(),
            origin_ts: NtpTimestamp::default(),
            receive_ts: NtpTimestamp::from_system_time(receive),
            transmit_ts: NtpTimestamp::from_system_time(receive + delta),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(NTP_PACKET_LEN);
        buf.put_u8((self.li & 0b11) << 6 | (self.version & 0b111) << 3 | (self.mode & 0b111));
        buf.put_u8(self.stratum);
        buf.put_i8(self.poll);
        buf.put_i8(self.precision);
        self.root_delay.put(buf);
        self.root_dispersion.put(buf);
        buf.put_slice(&self.reference_id);
        self.reference_ts.put(buf);
        self.origin_ts.put(buf);
        self.receive_ts.put(buf);
        self.transmit_ts.put(buf);
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NTP_PACKET_LEN);
        self.encode(&mut buf);
        debug_assert_eq!(buf.len(), NTP_PACKET_LEN);
        buf.freeze()
    }

    pub fn parse(buf: &[u8]) -> DecodeResult<Self> {
        if buf.len() < NTP_PACKET_LEN {
            return Err(DecodeError::Truncated {
                kind: PacketKind::Ntp,
                expected: NTP_PACKET_LEN,
                got: buf.len(),
            });
        }

        let mut cursor = &buf[..NTP_PACKET_LEN];
        let flags = cursor.get_u8();
        let stratum = cursor.get_u8();
        let poll = cursor.get_i8();
        let precision = cursor.get_i8();
        let root_delay = NtpShort::get(&mut cursor);
        let root_dispersion = NtpShort::get(&mut cursor);
        let mut reference_id = [0u8; 4];
        cursor.copy_to_slice(&mut reference_id);

        Ok(Self {
            li: (flags >> 6) & 0b11,
            version: (flags >> 3) & 0b111,
            mode: flags & 0b111,
            stratum,
            poll,
            precision,
            root_delay,
            root_dispersion,
            reference_id,
            reference_ts: NtpTimestamp::get(&mut cursor),
            origin_ts: NtpTimestamp::get(&mut cursor),
            receive_ts: NtpTimestamp::get(&mut cursor),
            transmit_ts: NtpTimestamp::get(&mut cursor),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_request() -> NtpPacket {
        NtpPacket {
            li: 3,
            version: 4,
            mode: NtpPacket::MODE_CLIENT,
            stratum: 0,
            poll: -6,
            precision: -20,
            root_delay: NtpShort::new(1, 0x8000),
            root_dispersion: NtpShort::new(0, 42),
            reference_id: *b"INIT",
            reference_ts: NtpTimestamp::new(1, 2),
            origin_ts: NtpTimestamp::new(3, 4),
            receive_ts: NtpTimestamp::new(5, 6),
            transmit_ts: NtpTimestamp::new(0xdead_beef, 0xffff_ffff),
        }
    }

    #[test]
    fn test_ntp_roundtrip() {
        let original = client_request();
        let bytes = original.serialize();
        assert_eq!(bytes.len(), NTP_PACKET_LEN);
        assert_eq!(NtpPacket::parse(&bytes).unwrap(), original);
    }

    #[test]
    fn test_first_byte_packing() {
        let bytes = client_request().serialize();
        // LI=3, VN=4, Mode=3
        assert_eq!(bytes[0], 0b11_100_011);
        assert_eq!(bytes[2], (-6i8) as u8);
        assert_eq!(&bytes[12..16], b"INIT");
    }

    #[test]
    fn test_too_short() {
        let bytes = client_request().serialize();
        assert!(matches!(
            NtpPacket::parse(&bytes[..47]),
            Err(DecodeError::Truncated { kind: PacketKind::Ntp, .. })
        ));
    }

    #[test]
    fn test_timestamp_unix_conversion() {
        let ts = NtpTimestamp::from_unix(1_700_000_000.5);
        assert_eq!(ts.seconds as u64, 1_700_000_000 + NtpTimestamp::UNIX_EPOCH_OFFSET);
        assert_eq!(ts.fraction, 1 << 31);
        let back = ts.to_unix_seconds();
        assert!((back - 1_700_000_000.5).abs() <= 1.0 / FRACTION_SCALE);
    }

    #[test]
    fn test_unix_epoch_is_offset() {
        let ts = NtpTimestamp::from_unix(0.0);
        assert_eq!(ts, NtpTimestamp::new(2_208_988_800, 0));
        assert_eq!(ts.to_unix_seconds(), 0.0);
    }

    #[test]
    fn test_server_reply() {
        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let reply = NtpPacket::server_reply(at, Duration::from_millis(500), None);
        assert_eq!(reply.mode, NtpPacket::MODE_SERVER);
        assert_eq!(reply.version, 4);
        assert_eq!(reply.stratum, 1);
        assert_eq!(&reply.reference_id, b"XCOM");
        assert_eq!(reply.receive_ts.to_unix_seconds(), 1_700_000_000.0);
        assert!((reply.transmit_ts.to_unix_seconds() - 1_700_000_000.5).abs() < 1e-6);
    }
}
