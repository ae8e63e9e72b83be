//! Drive and inspect the fhcache object-handle cache.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};

mod app_config;
mod soak;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(
    version,
    about = "Object-handle cache for network file servers, with a synthetic soak workload."
)]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to an fhcache config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a concurrent synthetic workload against the simulated backend.
    Soak {
        /// How long to run, in seconds. Overrides `sim.seconds`.
        #[arg(short, long)]
        seconds: Option<u64>,

        /// Number of concurrent workers. Overrides `sim.workers`.
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Print the effective configuration as TOML.
    Config,
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let config = Config::load_or_default(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    Trc::default().init().unwrap_or_else(|e| {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    });

    match args.command.unwrap_or(Command::Soak {
        seconds: None,
        workers: None,
    }) {
        Command::Soak { seconds, workers } => {
            let seconds = seconds.unwrap_or(config.sim.seconds);
            let workers = workers.unwrap_or(config.sim.workers).max(1);
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .unwrap_or_else(|e| panic!("Failed to create Tokio runtime: {e}"));
            match runtime.block_on(soak::run(&config, seconds, workers)) {
                Ok(report) => {
                    info!(
                        ops = report.ops,
                        stale = report.stale,
                        expired = report.expired,
                        errors = report.errors,
                        peak = report.stats.entries_peak,
                        reclaimed = report.stats.entries_reclaimed,
                        passes = report.stats.passes,
                        "soak finished"
                    );
                    if !report.within_watermark {
                        error!("cache did not converge to its watermark");
                        std::process::exit(2);
                    }
                }
                Err(e) => {
                    error!("Soak failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Config => match config.to_toml() {
            Ok(text) => print!("{text}"),
            Err(e) => {
                error!("Failed to render configuration: {e}");
                std::process::exit(1);
            }
        },
    }
}
