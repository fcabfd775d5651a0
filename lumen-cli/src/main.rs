//! Lumen CLI - content-addressed vision analysis from the command line.

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use lumen_core::AnalysisMode;
use tracing_subscriber::EnvFilter;

mod commands;
mod exit_codes;
mod utils;

use exit_codes::ExitCode;

const EXIT_CODES_HELP: &str = "\
Exit codes:
  0    success
  1    general error (including cache miss on lookup)
  64   usage error
  65   model output failed validation
  66   input file missing or unreadable
  69   image origin, model or lock backend unavailable
  74   local I/O error
  75   timed out, retry later
  78   configuration error
  130  interrupted";

#[derive(Parser)]
#[command(name = "lumen")]
#[command(author, version, about = "Content-addressed vision analysis cache", long_about = None)]
#[command(after_help = EXIT_CODES_HELP)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze an image by URL, reusing cached or in-flight results
    Analyze {
        /// Image URL
        #[arg(value_name = "URL")]
        url: String,

        /// Analysis depth
        #[arg(short, long, default_value = "full")]
        mode: AnalysisMode,

        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,

        /// Keep the downloaded copy of the image instead of deleting it
        #[arg(long)]
        keep_scratch: bool,
    },

    /// Print the content hash of a local file
    Hash {
        /// Path to the file to hash
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Look up a cached analysis by content hash
    Lookup {
        /// 64-character hex content hash
        #[arg(value_name = "HASH")]
        hash: String,

        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Force-release a stale coordination lock
    Unlock {
        /// 64-character hex content hash
        #[arg(value_name = "HASH")]
        hash: String,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Analyze {
            url,
            mode,
            json,
            keep_scratch,
        } => commands::analyze::execute(url, mode, json, keep_scratch).await,
        Commands::Hash { file } => commands::hash::execute(file).await,
        Commands::Lookup { hash, json } => commands::lookup::execute(hash, json).await,
        Commands::Unlock { hash } => commands::unlock::execute(hash).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let exit = match run(cli).await {
        Ok(()) => ExitCode::success(),
        Err(err) => ExitCode::from_anyhow(&err),
    };

    if let Some(message) = &exit.message {
        eprintln!("{} {}", "error:".red().bold(), message);
    }
    std::process::exit(exit.code);
}
