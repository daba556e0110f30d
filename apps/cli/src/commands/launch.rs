//! `launch`: start one training process per device and supervise them.

use crate::commands::types::LaunchArgs;
use crate::config::EmberConfig;
use anyhow::{Context, Result};
use colored::Colorize;
use ember_training::{
    ExternalProcedure, LaunchConfig, LaunchError, LaunchReport, Launcher, OutputLayout, ReferenceProcedure,
    StdoutProgressSink, SystemDeviceProbe, assemble_layers,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A launch configuration plus the procedure that will run it.
#[derive(Debug, Clone)]
pub struct PreparedLaunch {
    pub launch: LaunchConfig,
    pub trainer: Option<String>,
    pub trainer_args: Vec<String>,
}

impl PreparedLaunch {
    pub fn launcher(&self, allow_cpu: bool) -> Result<Launcher> {
        let launcher = match &self.trainer {
            Some(program) => Launcher::new(ExternalProcedure::new(program, self.trainer_args.clone()), SystemDeviceProbe),
            None => {
                let exe = std::env::current_exe().context("Failed to locate the ember-cli executable")?;
                Launcher::new(ReferenceProcedure::new(exe), SystemDeviceProbe)
            }
        };
        Ok(launcher.allow_cpu(allow_cpu))
    }
}

/// Layer defaults, `ember.toml`, `--config` and flags into a [`LaunchConfig`].
pub fn prepare(args: &LaunchArgs, workspace: &Path) -> Result<PreparedLaunch> {
    let workspace_file = EmberConfig::discover(workspace)?;
    let extra_file = match &args.config {
        Some(extra) => {
            let path = if extra.is_absolute() { extra.clone() } else { workspace.join(extra) };
            Some(EmberConfig::load(&path)?)
        }
        None => None,
    };

    let mut layers = vec![workspace_file.run_pairs()?];
    if let Some(extra) = &extra_file {
        layers.push(extra.run_pairs()?);
    }
    layers.push(args.run.to_pairs().into_iter().map(|(name, value)| (name.to_string(), value)).collect());
    let run = assemble_layers(layers, workspace).map_err(LaunchError::from)?;

    let file = match extra_file {
        Some(extra) => workspace_file.merge(extra),
        None => workspace_file,
    };

    let section = file.launch;
    let nproc = args.nproc_per_node.or(section.nproc_per_node).unwrap_or(1);
    let mut launch = LaunchConfig::new(run, nproc, workspace.to_path_buf());
    if let Some(addr) = args.master_addr.clone().or(section.master_addr) {
        launch.master_addr = addr;
    }
    if let Some(port) = args.master_port.or(section.master_port) {
        launch.master_port = port;
    }
    launch.wandb_project = args.wandb_project.clone().or(section.wandb_project);
    launch.validate().map_err(LaunchError::from)?;

    let trainer = args.trainer.clone().or(section.trainer);
    let trainer_args =
        if args.trainer_args.is_empty() { section.trainer_args.unwrap_or_default() } else { args.trainer_args.clone() };

    Ok(PreparedLaunch { launch, trainer, trainer_args })
}

/// Point the run at the newest checkpoint unless one was named explicitly.
pub(crate) fn apply_resume(launch: &mut LaunchConfig) -> Result<()> {
    if launch.run.resume_from_checkpoint.is_some() {
        return Ok(());
    }
    let layout = OutputLayout::new(&launch.run.output_dir);
    match layout.latest_checkpoint()? {
        Some(latest) => {
            tracing::info!(step = latest.step, "resuming from {}", latest.path.display());
            launch.run = launch.run.with_resume_from(Some(latest.path));
        }
        None => {
            tracing::warn!("no checkpoint found in {}; starting fresh", layout.root().display());
        }
    }
    Ok(())
}

pub async fn execute(args: LaunchArgs, workspace: PathBuf) -> Result<()> {
    let mut prepared = prepare(&args, &workspace)?;
    if args.resume {
        apply_resume(&mut prepared.launch)?;
    }

    let launcher = prepared.launcher(args.allow_cpu)?;
    let launch = &prepared.launch;
    tracing::info!(
        procedure = launcher.procedure_id(),
        nproc_per_node = launch.nproc_per_node,
        effective_batch_size = launch.effective_batch_size(),
        "launching {}",
        launch.run.model_name_or_path
    );

    let report = launcher.launch(launch, Arc::new(StdoutProgressSink)).await?;
    print_summary(&report);
    let report = report.into_result()?;

    println!();
    println!(
        "{} {} rank(s) finished in {:.1}s",
        "✓".green(),
        report.ranks.len(),
        report.elapsed.as_secs_f64()
    );
    println!("  Output: {}", launch.run.output_dir.display().to_string().cyan());
    Ok(())
}

fn print_summary(report: &LaunchReport) {
    if report.success() {
        return;
    }
    eprintln!();
    eprintln!("{}", format!("Run {} failed", report.run_id).bold().red());
    for rank in &report.ranks {
        let status = match (rank.success, rank.terminated, rank.code) {
            (true, _, _) => "ok".green(),
            (false, true, _) => "terminated".yellow(),
            (false, false, Some(code)) => format!("exit {code}").red(),
            (false, false, None) => "killed by signal".red(),
        };
        let pid = rank.pid.map_or_else(|| "-".to_string(), |p| p.to_string());
        eprintln!("  rank {:<3} pid {:<8} {}", rank.rank, pid, status);
    }
}
