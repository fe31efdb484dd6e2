//! Quicksilver Tier CLI
//!
//! Runs the canned scenarios interpreted and optimized, and reports tier
//! state, inlining decisions and deoptimizations.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use quicksilver_tier::config::EngineConfig;
use quicksilver_tier::scenarios::{self, Scenario, ScenarioReport};
use quicksilver_tier::VERSION;
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(name = "quicksilver-tier")]
#[command(version, about = "Tiered inlining and deoptimization engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List the available scenarios
    List,

    /// Run a scenario, or every scenario with `all`
    Run {
        /// Scenario name
        scenario: String,

        /// JSON engine configuration; unspecified fields keep their defaults
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Print the disassembled program first
        #[arg(long)]
        disasm: bool,
    },

    /// Print the default configuration as JSON
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match execute(cli.command) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(error) => {
            eprintln!("error: {:#}", error);
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins; otherwise the `-v` count picks the level
fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Returns false if any scenario's runs disagreed
fn execute(command: Commands) -> Result<bool> {
    match command {
        Commands::List => {
            for scenario in scenarios::all() {
                println!("{:<20} {}", scenario.name, scenario.description);
            }
            Ok(true)
        }
        Commands::Config => {
            println!("{}", EngineConfig::default().to_json()?);
            Ok(true)
        }
        Commands::Run {
            scenario,
            config,
            json,
            disasm,
        } => {
            let config = match config {
                Some(path) => EngineConfig::from_file(&path)
                    .with_context(|| format!("loading configuration from {}", path.display()))?,
                None => EngineConfig::default(),
            };
            let selected: Vec<&Scenario> = if scenario == "all" {
                scenarios::all().iter().collect()
            } else {
                match scenarios::find(&scenario) {
                    Some(found) => vec![found],
                    None => bail!("unknown scenario '{}' (see `quicksilver-tier list`)", scenario),
                }
            };

            let mut reports = Vec::new();
            for scenario in selected {
                if disasm {
                    println!("{}", scenario.program()?.disassemble());
                }
                let report = scenario
                    .run(&config)
                    .with_context(|| format!("running scenario {}", scenario.name))?;
                if !json {
                    print_report(&report);
                }
                reports.push(report);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            }
            Ok(reports.iter().all(|r| r.transparent))
        }
    }
}

fn print_report(report: &ScenarioReport) {
    println!("=== {} (quicksilver-tier {}) ===", report.name, VERSION);
    for line in &report.optimized.output {
        println!("  | {}", line);
    }
    println!("  results: {}", report.optimized.results.join(", "));
    if report.transparent {
        println!("  interpreted and optimized runs agree");
    } else {
        println!("  MISMATCH");
        println!("    interpreted: {:?}", report.interpreted);
        println!("    optimized:   {:?}", report.optimized);
    }
    println!();
    for function in report.functions.iter().filter(|f| f.compilations > 0 || f.deopt_count > 0) {
        print!("{}", function);
    }
    println!();
    print!("{}", report.summary);
    println!();
}
