//! Snapcrawl CLI - harvest deduplicated images from a set of seed pages.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use snapcrawl_core::config::PackFormat;
use tracing_subscriber::{fmt, EnvFilter};

mod commands;
mod exit_codes;

use exit_codes::ExitCode;

const EXIT_CODES_HELP: &str = "Exit codes:
  0   Success
  1   General error
  64  Usage or configuration error
  66  Input not found (config, database, storage folder)
  69  Network unavailable
  74  I/O or database error";

#[derive(Parser)]
#[command(name = "snapcrawl")]
#[command(author, version, about = "Image harvester with perceptual deduplication", long_about = None)]
#[command(after_help = EXIT_CODES_HELP)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    /// Log debug output (repeat for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the configured sources until the target is reached
    Start {
        /// Override project.target_saved_count (0 = no target)
        #[arg(short, long)]
        target: Option<u64>,

        /// Seed URLs to use instead of download.sources
        #[arg(value_name = "URL")]
        sources: Vec<String>,
    },

    /// Show what has been stored so far
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,

        /// Rows to show per breakdown
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Archive the storage folder without compression
    Pack {
        /// Archive format (defaults to packing.format)
        #[arg(short, long, value_enum)]
        format: Option<ArchiveFormat>,

        /// Directory for the archive (defaults to the storage folder's parent)
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,
    },

    /// Re-score stored images and remove the ones that are not photos
    Clean {
        /// Only report, whatever postfilter.dry_run says
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ArchiveFormat {
    Zip,
    Tar,
}

impl From<PackFormat> for ArchiveFormat {
    fn from(format: PackFormat) -> Self {
        match format {
            PackFormat::Zip => Self::Zip,
            PackFormat::Tar => Self::Tar,
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let default = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "snapcrawl_core=info,snapcrawl=info",
        (false, 1) => "snapcrawl_core=debug,snapcrawl=debug,info",
        (false, _) => "snapcrawl_core=trace,snapcrawl=trace,debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                exit_codes::USAGE_ERROR
            } else {
                exit_codes::SUCCESS
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    init_tracing(cli.verbose, cli.quiet);

    let result = match cli.command {
        Commands::Start { target, sources } => {
            commands::start::execute(&cli.config, target, sources, cli.quiet).await
        }
        Commands::Status { json, limit } => {
            commands::status::execute(&cli.config, json, limit).await
        }
        Commands::Pack { format, output } => {
            commands::pack::execute(&cli.config, format, output, cli.quiet).await
        }
        Commands::Clean { dry_run } => {
            commands::clean::execute(&cli.config, dry_run, cli.quiet).await
        }
    };

    let exit = match result {
        Ok(()) => ExitCode::success(),
        Err(err) => ExitCode::from_anyhow(&err),
    };
    if let Some(message) = &exit.message {
        eprintln!("{} {}", "error:".red().bold(), message);
    }
    std::process::exit(exit.code);
}
