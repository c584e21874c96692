//! Network module - Mock peer endpoints speaking to the peer under test
//!
//! Provides:
//! - Mock servers capturing packets the peer sends (TCP, and UDP for NTP)
//! - Mock clients sending one packet to the peer and awaiting the reply
//! - Connection handling with bounded, fragment-tolerant framing

mod client;
mod connection;
mod server;
mod udp;

pub use client::*;
pub use connection::*;
pub use server::*;
pub use udp::*;

use std::time::Duration;

use crate::config::Config;
use crate::protocol::DEFAULT_MAX_FRAME_LEN;

/// Timing and size policy shared by all endpoints
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bound on each individual wait for bytes while framing a packet
    pub frame_wait: Duration,
    /// Bound on popping a scripted response
    pub response_wait: Duration,
    /// Pause before a general handler sends its scripted response
    pub response_delay: Duration,
    /// Bound on establishing an outbound connection
    pub connect_timeout: Duration,
    /// A mock client stops reading after this long without data
    pub client_idle: Duration,
    /// Largest data frame accepted from the peer
    pub max_frame_len: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            frame_wait: Duration::from_secs(3),
            response_wait: Duration::from_secs(2),
            response_delay: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(3),
            client_idle: Duration::from_secs(1),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl NetworkConfig {
    pub fn from_config(config: &Config) -> Self {
        let t = &config.timeouts;
        Self {
            frame_wait: Duration::from_millis(t.frame_wait_ms),
            response_wait: Duration::from_millis(t.response_wait_ms),
            response_delay: Duration::from_millis(t.response_delay_ms),
            connect_timeout: Duration::from_millis(t.connect_ms),
            client_idle: Duration::from_millis(t.client_idle_ms),
            max_frame_len: config.limits.max_frame_len,
        }
    }

    pub fn with_frame_wait(mut self, frame_wait: Duration) -> Self {
        self.frame_wait = frame_wait;
        self
    }

    pub fn with_response_wait(mut self, response_wait: Duration) -> Self {
        self.response_wait = response_wait;
        self
    }
}
