//! Testbench - Protocol conformance bench for DHT peers
//!
//! Loads test suites and runs them against the peer executable in the build
//! directory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use testbench::config::{self, Config};
use testbench::harness::{Runner, TestRegistry};
use testbench::suites;

/// Testbench - Loads and executes tests
#[derive(Parser)]
#[command(name = "testbench")]
#[command(author = "Testbench Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Loads and executes protocol conformance tests", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run test suites
    Run {
        /// Suite to load (repeatable)
        #[arg(short = 't', long = "test", required = true)]
        suites: Vec<String>,

        /// Directory holding the executables under test
        #[arg(short, long)]
        build_dir: Option<PathBuf>,

        /// Only run tests whose name contains this string
        #[arg(short, long)]
        filter: Option<String>,

        /// Write a JSON report to this file
        #[arg(short, long)]
        report: Option<PathBuf>,
    },

    /// List the tests of the given suites (all suites by default)
    List {
        #[arg(short = 't', long = "test")]
        suites: Vec<String>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Run {
            suites,
            build_dir,
            filter,
            report,
        } => {
            if let Some(dir) = build_dir {
                config.general.build_dir = dir;
            }
            let passed = run_tests(config, &suites, filter.as_deref(), report).await?;
            if !passed {
                std::process::exit(1);
            }
        }
        Commands::List { suites } => {
            let suites = if suites.is_empty() {
                suites::SUITES.iter().map(|s| s.to_string()).collect()
            } else {
                suites
            };
            let registry = load_suites(&suites)?;
            for name in registry.names() {
                println!("{}", name);
            }
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Register the named suites, in order
fn load_suites(names: &[String]) -> anyhow::Result<TestRegistry> {
    let mut registry = TestRegistry::new();
    for name in names {
        tracing::info!("Loading test: {}", name);
        suites::register(name, &mut registry)?;
    }
    Ok(registry)
}

/// Run the selected tests; returns whether all of them passed
async fn run_tests(
    mut config: Config,
    names: &[String],
    filter: Option<&str>,
    report_path: Option<PathBuf>,
) -> anyhow::Result<bool> {
    let build_dir = std::env::current_dir()?.join(&config.general.build_dir);
    if !build_dir.is_dir() {
        anyhow::bail!("Build directory does not exist: {}", build_dir.display());
    }
    config.general.build_dir = build_dir.clone();

    let mut registry = load_suites(names)?;
    if let Some(pattern) = filter {
        registry.filter(pattern);
    }
    if registry.is_empty() {
        anyhow::bail!("No tests have been found!");
    }

    let runner = Runner::new(Arc::new(config), build_dir);
    let report = runner.run(&registry).await;

    if let Some(path) = report_path {
        report
            .write_json(&path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        tracing::info!("Report written to {}", path.display());
    }

    Ok(report.all_passed())
}
