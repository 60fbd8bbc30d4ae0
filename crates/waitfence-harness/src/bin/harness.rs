//! CLI entrypoint for the waitfence stress harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use waitfence_harness::{ScenarioReport, ScenarioResult, ScenarioSet};

/// Stress tooling for the waitfence primitives.
#[derive(Debug, Parser)]
#[command(name = "waitfence-harness")]
#[command(about = "Stress scenarios for the waitfence synchronization primitives")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the built-in scenarios.
    List,
    /// Run scenarios and optionally write a report.
    Run {
        /// Run only the named scenario.
        #[arg(long)]
        scenario: Option<String>,
        /// Scenario set JSON file; defaults to the built-in suite.
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// Output report path (markdown).
        #[arg(long)]
        report: Option<PathBuf>,
        /// Output report path (JSON).
        #[arg(long)]
        report_json: Option<PathBuf>,
    },
    /// Single-threaded fence FIFO smoke check.
    Fence {
        /// Number of references to arm and fire.
        #[arg(long, default_value_t = 8)]
        references: usize,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::List => {
            for spec in ScenarioSet::builtin().scenarios {
                println!(
                    "{:<16} waiters={:<3} batches={:?} deadline_ns={:?} iterations={}",
                    spec.name, spec.waiters, spec.signal_batches, spec.deadline_ns, spec.iterations
                );
            }
            Ok(())
        }
        Command::Run {
            scenario,
            fixture,
            report,
            report_json,
        } => run_scenarios(scenario, fixture, report, report_json),
        Command::Fence { references } => {
            waitfence_harness::runner::run_fence_fifo(references).map_err(Into::into)
        }
    }
}

fn run_scenarios(
    scenario: Option<String>,
    fixture: Option<PathBuf>,
    report_md: Option<PathBuf>,
    report_json: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let set = match fixture {
        Some(path) => ScenarioSet::from_file(&path)?,
        None => ScenarioSet::builtin(),
    };

    let mut results = Vec::new();
    for spec in &set.scenarios {
        if let Some(name) = &scenario {
            if &spec.name != name {
                continue;
            }
        }
        eprintln!("running {} x{}", spec.name, spec.iterations);
        let mut result = ScenarioResult {
            scenario: spec.name.clone(),
            iterations: spec.iterations,
            passed: 0,
            failed: 0,
            notes: Vec::new(),
        };
        for _ in 0..spec.iterations {
            let outcome = waitfence_harness::runner::run_scenario(spec);
            match waitfence_harness::runner::check_outcome(spec, &outcome) {
                Ok(()) => result.passed += 1,
                Err(note) => {
                    result.failed += 1;
                    result.notes.push(note);
                }
            }
        }
        results.push(result);
    }
    if results.is_empty() {
        return Err(match scenario {
            Some(name) => format!("no scenario named {name}").into(),
            None => "no scenarios to run".into(),
        });
    }

    let report = ScenarioReport::new("waitfence stress run", results);
    if let Some(path) = report_md {
        std::fs::write(&path, report.to_markdown())?;
        eprintln!("wrote {}", path.display());
    }
    if let Some(path) = report_json {
        std::fs::write(&path, report.to_json())?;
        eprintln!("wrote {}", path.display());
    }
    println!("{}", report.to_markdown());

    if report.total_failed() > 0 {
        return Err(format!("{} failed iterations", report.total_failed()).into());
    }
    Ok(())
}
