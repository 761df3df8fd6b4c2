//! Upcover CLI - Command-line interface
//!
//! Runs the upstream coverage pipeline described by an INI config file.

mod commands;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::{info::InfoArgs, plan::PlanArgs, run::RunArgs};

#[derive(Parser)]
#[command(name = "upcover")]
#[command(version = upcover::VERSION, about = "Upstream drainage coverage for hazard rasters", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for every configured raster
    Run {
        /// Config file (default: ~/.upcover/config.ini)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Override the workspace directory
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// Worker threads (0 runs every stage on the main thread)
        #[arg(long)]
        workers: Option<usize>,

        /// Debug-level logging
        #[arg(long, short)]
        verbose: bool,
    },

    /// Print the stage chain per raster without running it
    Plan {
        /// Config file (default: ~/.upcover/config.ini)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },

    /// Show metadata of a raster file
    Info {
        /// Raster file
        raster: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            workspace,
            workers,
            verbose,
        } => commands::run::run(RunArgs {
            config,
            workspace,
            workers,
            verbose,
        }),
        Commands::Plan { config } => commands::plan::run(PlanArgs { config }),
        Commands::Info { raster } => commands::info::run(InfoArgs { raster }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
