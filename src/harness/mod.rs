//! Harness module - Registers, runs and reports test cases
//!
//! Provides:
//! - An ordered registry of named tests
//! - A per-test context starting mock peers, clients and peer processes
//! - A teardown stack executed last-in-first-out after every test
//! - A runner producing a serializable report

mod context;
mod registry;
mod runner;
mod teardown;

pub use context::*;
pub use registry::*;
pub use runner::*;
pub use teardown::*;

use std::future::Future;
use std::pin::Pin;

/// Future returned by a test body
pub type TestFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

/// A test body
pub type TestFn = fn(TestContext) -> TestFuture;
