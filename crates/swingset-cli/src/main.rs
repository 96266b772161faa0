mod commands;
mod opts;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::dump::DumpArgs;
use commands::transcript::TranscriptArgs;
use opts::StoreOpts;

#[derive(Parser, Debug)]
#[command(name = "swingset", version, about = "Inspect a SwingSet kernel store")]
struct Cli {
    #[command(flatten)]
    opts: StoreOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crank number, activity hash, queue length and vats
    Stats,

    /// List stored keys with their decoded values
    Dump(DumpArgs),

    /// Show a vat's current transcript span
    Transcript(TranscriptArgs),

    /// Fold the commit log into a fresh base image
    Compact,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging();
    let opts = &cli.opts;

    match cli.command {
        Command::Stats => commands::stats::cmd_stats(opts),
        Command::Dump(args) => commands::dump::cmd_dump(opts, &args),
        Command::Transcript(args) => commands::transcript::cmd_transcript(opts, &args),
        Command::Compact => commands::compact::cmd_compact(opts),
    }
}

/// Logs go to stderr so they never mix with command output.
fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
