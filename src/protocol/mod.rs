//! Protocol module - Wire formats spoken with the peer under test
//!
//! - Control packets: fixed 11 bytes, ring maintenance (JOIN, NOTIFY, ...)
//! - Data packets: 7 byte header + key + value, GET/SET/DELETE
//! - NTP packets: fixed 48 bytes, carried over UDP
//!
//! All integers are big-endian.

mod codec;
mod ntp;
mod packet;

pub use codec::*;
pub use ntp::*;
pub use packet::*;

/// Port the mock anchor peer listens on
pub const DEFAULT_ANCHOR_PORT: u16 = 1400;
