use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use bastion_security::pinned_root_key;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod apply;
mod completion;
mod dispatch;
mod render;

use completion::CliCompletionShell;

const LOG_ENV_VAR: &str = "BASTION_LOG";

#[derive(Parser, Debug)]
#[command(name = "bastion")]
#[command(about = "Signed-manifest installer with transactional rollback", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the content digest of a file.
    Hash {
        file: PathBuf,
        /// Report the path relative to this directory.
        #[arg(long)]
        base: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Check a manifest against its detached signature.
    Verify {
        manifest: PathBuf,
        #[arg(long)]
        allow_unsigned: bool,
        #[arg(long)]
        json: bool,
    },
    /// Describe files under a base directory as an install manifest.
    Manifest {
        base: PathBuf,
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long)]
        name: String,
        #[arg(long)]
        version: String,
    },
    /// Compare an installed tree with a manifest.
    Check {
        manifest: PathBuf,
        #[arg(long)]
        target: PathBuf,
        #[arg(long)]
        allow_unsigned: bool,
    },
    /// Install the files a manifest lists, rolling back on failure.
    Apply {
        manifest: PathBuf,
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        target: PathBuf,
        #[arg(long)]
        allow_unsigned: bool,
    },
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    dispatch::run_cli(cli, pinned_root_key())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();
}

#[cfg(test)]
mod tests;
