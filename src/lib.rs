//! Testbench - Protocol conformance bench for DHT peers
//!
//! Drives a peer executable through the DHT control and data protocols
//! over real sockets, using mock peers and clients to observe and steer it.

pub mod config;
pub mod harness;
pub mod network;
pub mod process;
pub mod protocol;
pub mod suites;
