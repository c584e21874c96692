//! Per-test teardown stack

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::network::{MockClient, MockServer, UdpMockServer};
use crate::process::Supervisor;

/// Something a test started that must be shut down afterwards
#[async_trait]
pub trait Teardown: Send + Sync {
    /// Label used in logs
    fn label(&self) -> String;

    /// Release the resource. `failed` tells whether the test failed.
    async fn teardown(&self, failed: bool);
}

#[async_trait]
impl Teardown for MockServer {
    fn label(&self) -> String {
        format!("mock server on port {}", self.port())
    }

    async fn teardown(&self, _failed: bool) {
        self.stop().await;
    }
}

#[async_trait]
impl Teardown for UdpMockServer {
    fn label(&self) -> String {
        format!("mock NTP server on port {}", self.port())
    }

    async fn teardown(&self, _failed: bool) {
        self.stop().await;
    }
}

#[async_trait]
impl Teardown for MockClient {
    fn label(&self) -> String {
        format!("mock client to {}", self.addr())
    }

    async fn teardown(&self, _failed: bool) {
        self.stop().await;
    }
}

#[async_trait]
impl Teardown for Supervisor {
    fn label(&self) -> String {
        self.spec().to_string()
    }

    async fn teardown(&self, failed: bool) {
        self.stop().await;
        let outcome = match self.collect().await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("No outcome for {}: {}", self.label(), e);
                return;
            }
        };

        if let Some(signal) = outcome.signal_name() {
            tracing::debug!("{} ended by {}", self.label(), signal);
        }
        if failed {
            tracing::error!("Test status: failed. Output of {}", self.label());
            if !outcome.stderr.is_empty() {
                tracing::error!("stderr:\n{}", outcome.stderr_lossy());
            }
            if !outcome.stdout.is_empty() {
                tracing::error!("stdout:\n{}", outcome.stdout_lossy());
            }
        }
    }
}

/// Teardown entries of one test, run last-in-first-out
#[derive(Default)]
pub struct TeardownStack {
    entries: Mutex<Vec<Arc<dyn Teardown>>>,
}

impl TeardownStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, entry: Arc<dyn Teardown>) {
        self.entries.lock().await.push(entry);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Drain and run every entry, newest first
    pub async fn run(&self, failed: bool) {
        let entries = std::mem::take(&mut *self.entries.lock().await);
        for entry in entries.into_iter().rev() {
            tracing::debug!("Cleaning up {}", entry.label());
            entry.teardown(failed).await;
        }
    }
}
