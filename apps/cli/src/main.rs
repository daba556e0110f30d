//! Ember CLI - launcher for distributed fine-tuning runs
//!
//! Turns one invocation into one training process per device, streams their
//! output, and fails fast when any of them dies.

mod commands;
mod config;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, shells};
use colored::Colorize;
use ember_training::{BackendConfigError, ConfigError, LaunchError};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use commands::{LaunchArgs, PlanArgs, WorkerArgs, checkpoints, launch, plan, worker};

const WORKSPACE_ENV: &str = "EMBER_WORKSPACE";
const LOG_ENV: &str = "EMBER_LOG";

/// Ember - distributed fine-tuning launcher
///
/// Assembles one immutable run configuration from `ember.toml`, `--config`
/// and flags, checks it against the machine and the distributed-backend
/// file, then starts one training process per device.
#[derive(Parser, Debug)]
#[command(name = "ember-cli", author, version, about = "Ember - distributed fine-tuning launcher")]
struct Args {
    /// Log level (trace, debug, info, warn, error); EMBER_LOG overrides it
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Workspace directory (overrides EMBER_WORKSPACE)
    #[arg(short = 'w', long, global = true)]
    workspace: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch a training run
    ///
    /// Starts one process per device, each with the same run configuration and
    /// its own rank. When any rank fails the others are stopped and the
    /// failing rank's exit code is returned.
    Launch(LaunchArgs),

    /// Show what a launch would do without starting anything
    ///
    /// Assembles the configuration, runs every preflight check and reports the
    /// effective batch size, the step count and the resolved backend config.
    Plan(PlanArgs),

    /// Run the reference training procedure for one rank
    ///
    /// Normally started by `launch`; reads its rank and world size from the
    /// launcher's environment.
    Worker(WorkerArgs),

    /// List the checkpoints of a run, newest first
    Checkpoints {
        /// Output directory of the run
        output_dir: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Resolve the workspace root: `--workspace`, then `EMBER_WORKSPACE`, then the current directory.
fn resolve_workspace(arg: Option<String>) -> anyhow::Result<PathBuf> {
    let raw = arg.or_else(|| std::env::var(WORKSPACE_ENV).ok().filter(|v| !v.trim().is_empty()));
    let path = match raw {
        Some(raw) => PathBuf::from(raw),
        None => std::env::current_dir()?,
    };
    Ok(std::path::absolute(path)?)
}

fn init_tracing(log_level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).or_else(|_| EnvFilter::try_new(log_level))?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .without_time()
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Exit code for a failed command: configuration problems are 2, a failed
/// rank passes its own code through, everything else is 1.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    let code = if let Some(e) = err.downcast_ref::<LaunchError>() {
        e.exit_code()
    } else if err.downcast_ref::<ConfigError>().is_some() || err.downcast_ref::<BackendConfigError>().is_some() {
        2
    } else {
        1
    };
    u8::try_from(code).ok().filter(|c| *c != 0).unwrap_or(1)
}

async fn run(args: Args) -> anyhow::Result<()> {
    init_tracing(&args.log_level)?;
    let workspace = resolve_workspace(args.workspace)?;

    match args.command {
        Command::Launch(cmd) => launch::execute(cmd, workspace).await,
        Command::Plan(cmd) => plan::execute(cmd, workspace).await,
        Command::Worker(cmd) => worker::execute(cmd, workspace).await,
        Command::Checkpoints { output_dir, json } => checkpoints::execute(output_dir, json, &workspace).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Handle completion generation
    if let Ok(shell) = std::env::var("EMBER_GENERATE_COMPLETIONS") {
        let mut cmd = Args::command();
        match shell.as_str() {
            "bash" => generate(shells::Bash, &mut cmd, "ember-cli", &mut std::io::stdout()),
            "zsh" => generate(shells::Zsh, &mut cmd, "ember-cli", &mut std::io::stdout()),
            "fish" => generate(shells::Fish, &mut cmd, "ember-cli", &mut std::io::stdout()),
            "powershell" => generate(shells::PowerShell, &mut cmd, "ember-cli", &mut std::io::stdout()),
            "elvish" => generate(shells::Elvish, &mut cmd, "ember-cli", &mut std::io::stdout()),
            _ => {
                eprintln!("Unknown shell: {}. Supported: bash, zsh, fish, powershell, elvish", shell);
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        let config = anyhow::Error::from(ConfigError::Missing { field: "data_path" });
        assert_eq!(exit_code_for(&config), 2);

        let wrapped = anyhow::Error::from(LaunchError::from(ConfigError::Conflict("bf16 and fp16".into())));
        assert_eq!(exit_code_for(&wrapped), 2);

        let rank = anyhow::Error::from(LaunchError::RankFailed { rank: 1, code: 3 });
        assert_eq!(exit_code_for(&rank), 3);

        let other = anyhow::anyhow!("boom");
        assert_eq!(exit_code_for(&other), 1);
    }

    #[test]
    fn test_args_parse_hf_spelling() {
        let args = Args::try_parse_from([
            "ember-cli",
            "launch",
            "--nproc_per_node",
            "4",
            "--per_device_train_batch_size",
            "4",
            "--bf16",
            "--data-path",
            "train.jsonl",
        ])
        .unwrap();
        let Command::Launch(cmd) = args.command else { panic!("expected launch") };
        assert_eq!(cmd.nproc_per_node, Some(4));
        assert_eq!(cmd.run.per_device_train_batch_size.as_deref(), Some("4"));
        assert_eq!(cmd.run.bf16.as_deref(), Some("true"));
        assert_eq!(cmd.run.data_path.as_deref(), Some("train.jsonl"));
    }

    #[test]
    fn test_args_accept_negative_for_validation() {
        let args = Args::try_parse_from(["ember-cli", "launch", "--num-train-epochs", "-1"]).unwrap();
        let Command::Launch(cmd) = args.command else { panic!("expected launch") };
        assert_eq!(cmd.run.num_train_epochs.as_deref(), Some("-1"));
    }

    #[test]
    fn test_worker_takes_flags_raw() {
        let args =
            Args::try_parse_from(["ember-cli", "worker", "--local-rank", "1", "--optim", "adafactor", "--bf16"]).unwrap();
        let Command::Worker(cmd) = args.command else { panic!("expected worker") };
        assert_eq!(cmd.flags, ["--local-rank", "1", "--optim", "adafactor", "--bf16"]);
    }

    #[test]
    fn test_args_verify() {
        Args::command().debug_assert();
    }
}
