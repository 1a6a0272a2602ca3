//! routelab - emulated IP network lab
//!
//! Declares a small routed topology, realizes it on network namespaces
//! (or an in-memory emulator), configures the routers and checks
//! reachability between hosts with ping.

mod cli;
mod error;
mod harness;
mod lab;
mod manifest;
mod router;
mod substrate;
mod topology;

use cli::{Cli, Commands};
use error::{Error, Result};
use harness::{Harness, ProbeResult, Summary};
use lab::Lab;
use manifest::LabConfig;
use substrate::{MemorySubstrate, NetnsSubstrate, Substrate};

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Log to stderr; RUST_LOG wins over -v
fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
        }

        Commands::Init { file, force } => {
            if file.exists() && !force {
                eprintln!("Error: {} already exists. Use -y/--force to overwrite.", file.display());
                std::process::exit(1);
            }

            fs::write(&file, manifest::EXAMPLE_LAB)?;
            println!("Created {}", file.display());
            println!("\nNext steps:");
            println!("  1. Edit {} to describe your lab", file.display());
            println!("  2. Run 'routelab -c {} check' to validate it", file.display());
            println!("  3. Run 'sudo routelab -c {} run' to build and probe it", file.display());
        }

        Commands::Check => {
            let config = manifest::load(&cli.config)?;
            print_plan(&config)?;
            println!("\nConfiguration is valid.");
        }

        Commands::Run {
            simulate,
            output,
            json,
        } => {
            let config = manifest::load(&cli.config)?;
            let output = output.unwrap_or_else(|| config.config.output.clone());

            let (results, summary) = if simulate {
                run_lab(&config, MemorySubstrate::new(), &output)?
            } else {
                let substrate = NetnsSubstrate::new(&config.lab_name(), config.config.sudo)?;
                run_lab(&config, substrate, &output)?
            };

            if json {
                let report = serde_json::json!({
                    "lab": config.lab_name(),
                    "results": results,
                    "summary": summary,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\nProbes:");
                for result in &results {
                    let status = if result.success { "ok" } else { "FAILED" };
                    println!(
                        "  {} -> {} ({}): {}",
                        result.source, result.label, result.destination, status
                    );
                }
                println!(
                    "\n{}/{} probes succeeded, results written to {}",
                    summary.passed,
                    summary.total,
                    output.display()
                );
            }

            if !summary.all_passed() {
                std::process::exit(2);
            }
        }
    }

    Ok(())
}

/// Realize, configure and probe a lab, tearing it down on every path
fn run_lab<S: Substrate>(
    config: &LabConfig,
    substrate: S,
    output: &Path,
) -> Result<(Vec<ProbeResult>, Summary)> {
    let mut lab = Lab::new(config.topology()?, substrate);

    let outcome = exercise(&mut lab, config, output);
    let teardown = lab.teardown();

    let outcome = outcome?;
    teardown?;
    Ok(outcome)
}

fn exercise<S: Substrate>(
    lab: &mut Lab<S>,
    config: &LabConfig,
    output: &Path,
) -> Result<(Vec<ProbeResult>, Summary)> {
    info!(lab = %config.lab_name(), "realizing topology");
    lab.realize()?;

    lab.configure_all(&config.routes())?;

    let probes = config.probes(lab.topology())?;
    let sink = File::create(output).map_err(|e| Error::ResultSink {
        path: output.to_path_buf(),
        source: e,
    })?;

    let mut harness = Harness::new().with_sink(BufWriter::new(sink));
    if let Some(secs) = config.config.ping_timeout {
        harness = harness.with_timeout(Duration::from_secs(secs));
    }

    harness.run(lab, &probes)?;
    Ok((harness.results().to_vec(), harness.summary()))
}

/// Print what a run would build
fn print_plan(config: &LabConfig) -> Result<()> {
    let topology = config.topology()?;

    println!("Lab: {}", config.lab_name());
    println!("\nNodes:");
    for node in topology.nodes() {
        let address = node
            .address
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("  {:<8} {:<8} {}", node.name, node.role(), address);
    }

    println!("\nLinks:");
    for (_, link) in topology.links() {
        println!("  {}", link);
    }

    println!("\nRoutes:");
    for (router, route) in config.routes() {
        println!("  {:<8} {}", router, route);
    }

    println!("\nProbes:");
    for probe in config.probes(&topology)? {
        println!("  {} -> {} ({})", probe.source, probe.label, probe.destination);
    }

    if !topology.is_connected() {
        println!("\nWarning: topology has disconnected nodes");
    }

    Ok(())
}
