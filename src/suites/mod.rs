//! Suites module - Test suites selectable from the command line

pub mod dht;

use crate::harness::{RegistryError, RegistryResult, TestRegistry};

/// Names accepted by [`register`]
pub const SUITES: &[&str] = &["dht"];

/// Register every test of `suite`
pub fn register(suite: &str, registry: &mut TestRegistry) -> RegistryResult<()> {
    match suite {
        "dht" => dht::register(registry),
        other => Err(RegistryError::UnknownSuite(other.to_string())),
    }
}
