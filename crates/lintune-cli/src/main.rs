use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use lintune_core::OperatorInput;
use tracing_subscriber::EnvFilter;

mod completion;
mod dispatch;
mod render;
#[cfg(test)]
mod tests;

const LOG_ENV: &str = "LINTUNE_LOG";

#[derive(Parser, Debug)]
#[command(name = "lintune")]
#[command(about = "Provision and reconcile a Himmelblau-joined Linux host", long_about = None)]
struct Cli {
    /// Engine configuration file (defaults to /etc/lintune/lintune.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Filesystem root every managed path is resolved against.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Emit machine-readable JSON instead of terminal output.
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Probe the host and print its current state.
    Status,
    /// List the steps a run would apply, in order.
    Plan {
        #[command(flatten)]
        operator: OperatorArgs,
    },
    /// Apply every pending step, or a single one with --step.
    Run {
        #[arg(long)]
        step: Option<String>,
        #[command(flatten)]
        operator: OperatorArgs,
    },
    /// Undo service registration and configuration edits.
    Rollback,
    /// Roll back, then remove installed artifacts and caches.
    Uninstall {
        #[arg(long)]
        remove_toolchain: bool,
        #[arg(long)]
        revert_login_manager: bool,
    },
    /// List recorded configuration backups.
    Backups,
    /// Report Intune enrollment from the daemon journal.
    Enrollment,
    /// Clear the daemon's cached user and group data.
    CacheClear,
    /// Print the effective configuration as TOML.
    Config,
    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct OperatorArgs {
    /// Entra ID domain to join, e.g. contoso.onmicrosoft.com.
    #[arg(long)]
    domain: Option<String>,
    /// Also map directory users into the wheel group.
    #[arg(long)]
    elevated_groups: bool,
}

impl OperatorArgs {
    fn to_input(&self) -> OperatorInput {
        OperatorInput {
            domain: self.domain.clone(),
            grant_elevated_groups: self.elevated_groups,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliCompletionShell {
    Bash,
    Zsh,
    Fish,
    Powershell,
}

impl From<CliCompletionShell> for Shell {
    fn from(value: CliCompletionShell) -> Self {
        match value {
            CliCompletionShell::Bash => Shell::Bash,
            CliCompletionShell::Zsh => Shell::Zsh,
            CliCompletionShell::Fish => Shell::Fish,
            CliCompletionShell::Powershell => Shell::PowerShell,
        }
    }
}

fn default_log_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

fn init_logging(verbose: u8) {
    let filter = if verbose > 0 {
        EnvFilter::new(default_log_directive(verbose))
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dispatch::run_cli(cli)
}
