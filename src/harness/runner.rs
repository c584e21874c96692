//! Sequential test runner

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use super::{TeardownStack, TestCase, TestContext, TestRegistry};
use crate::config::Config;

/// Result of one test
#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Result of a whole run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub cases: Vec<CaseReport>,
}

impl RunReport {
    pub fn passed(&self) -> usize {
        self.cases.iter().filter(|case| case.passed).count()
    }

    pub fn failed(&self) -> usize {
        self.cases.len() - self.passed()
    }

    pub fn all_passed(&self) -> bool {
        self.failed() == 0
    }

    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Runs registered tests one after another
pub struct Runner {
    config: Arc<Config>,
    build_dir: PathBuf,
}

impl Runner {
    pub fn new(config: Arc<Config>, build_dir: PathBuf) -> Self {
        Self { config, build_dir }
    }

    pub async fn run(&self, registry: &TestRegistry) -> RunReport {
        let width = terminal_width();
        let mut report = RunReport::default();
        for case in registry.cases() {
            println!("{}", banner(&case.name, width));
            report.cases.push(self.run_case(case).await);
        }

        tracing::info!("{} passed, {} failed", report.passed(), report.failed());
        report
    }

    async fn run_case(&self, case: &TestCase) -> CaseReport {
        let teardown = Arc::new(TeardownStack::new());
        let ctx = TestContext::new(self.config.clone(), self.build_dir.clone(), teardown.clone());
        let started = Instant::now();

        // A panicking test fails instead of aborting the run
        let error = match tokio::spawn((case.run)(ctx)).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(e) if e.is_panic() => Some("Test panicked".to_string()),
            Err(e) => Some(e.to_string()),
        };

        match &error {
            None => tracing::info!("Test succeeded"),
            Some(reason) => tracing::error!("Test failed. Reason: {}", reason),
        }

        teardown.run(error.is_some()).await;

        CaseReport {
            name: case.name.clone(),
            passed: error.is_none(),
            error,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// `=== name ===` padded to `width`
pub fn banner(name: &str, width: usize) -> String {
    let filler = "=".repeat(width.saturating_sub(name.len() + 2) / 2);
    format!("{} {} {}", filler, name, filler)
}

fn terminal_width() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|columns| columns.parse().ok())
        .unwrap_or(80)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::TestFuture;

    async fn fails_body() -> anyhow::Result<()> {
        anyhow::ensure!(1 + 1 == 3, "Peer sent wrong node id in JOIN msg.");
        Ok(())
    }

    async fn panics_body() -> anyhow::Result<()> {
        panic!("boom")
    }

    async fn leaves_server_body(ctx: TestContext) -> anyhow::Result<()> {
        let server = ctx
            .start_peer(0, crate::network::HandlerKind::Control)
            .await?;
        anyhow::bail!("left server on port {} running", server.port())
    }

    fn passes(_ctx: TestContext) -> TestFuture {
        Box::pin(async { Ok(()) })
    }

    fn fails(_ctx: TestContext) -> TestFuture {
        Box::pin(fails_body())
    }

    fn panics(_ctx: TestContext) -> TestFuture {
        Box::pin(panics_body())
    }

    fn leaves_server(ctx: TestContext) -> TestFuture {
        Box::pin(leaves_server_body(ctx))
    }

    #[test]
    fn test_banner() {
        assert_eq!(banner("join", 12), "=== join ===");
        assert_eq!(banner("a_very_long_test_name", 4), " a_very_long_test_name ");
    }

    #[tokio::test]
    async fn test_reports_every_case() {
        let mut registry = TestRegistry::new();
        registry.register("passes", passes).unwrap();
        registry.register("fails", fails).unwrap();
        registry.register("panics", panics).unwrap();
        registry.register("leaves_server", leaves_server).unwrap();

        let runner = Runner::new(Arc::new(Config::default()), PathBuf::from("build"));
        let report = runner.run(&registry).await;

        assert_eq!(report.cases.len(), 4);
        assert_eq!(report.passed(), 1);
        assert!(!report.all_passed());
        assert_eq!(
            report.cases[1].error.as_deref(),
            Some("Peer sent wrong node id in JOIN msg.")
        );
        assert_eq!(report.cases[2].error.as_deref(), Some("Test panicked"));
        assert!(report.cases[3].error.as_deref().unwrap().starts_with("left server"));
    }

    #[tokio::test]
    async fn test_report_json() {
        let report = RunReport {
            cases: vec![CaseReport {
                name: "join_correct".to_string(),
                passed: true,
                error: None,
                duration_ms: 12,
            }],
        };
        let file = tempfile::NamedTempFile::new().unwrap();
        report.write_json(file.path()).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        assert_eq!(value["cases"][0]["name"], "join_correct");
        assert_eq!(value["cases"][0]["passed"], true);
        assert!(value["cases"][0].get("error").is_none());
    }
}
