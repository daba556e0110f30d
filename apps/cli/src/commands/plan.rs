//! `plan`: assemble and preflight a launch without spawning anything.

use crate::commands::launch::{apply_resume, prepare};
use crate::commands::types::PlanArgs;
use anyhow::Result;
use colored::Colorize;
use ember_training::dataset::{read_jsonl_records, validate_records};
use ember_training::{DatasetSource, StepPlan};
use serde_json::json;
use std::path::PathBuf;

pub async fn execute(args: PlanArgs, workspace: PathBuf) -> Result<()> {
    let mut prepared = prepare(&args.launch, &workspace)?;
    if args.launch.resume {
        apply_resume(&mut prepared.launch)?;
    }
    let launcher = prepared.launcher(args.launch.allow_cpu)?;
    let launch = &prepared.launch;
    let preflight = launcher.preflight(launch)?;

    let (num_samples, steps) = match DatasetSource::from_identifier(&launch.run.data_path, &workspace) {
        DatasetSource::Local(path) => {
            let records = read_jsonl_records(&path)?;
            validate_records(&records)?;
            let n = records.len() as u64;
            (Some(n), Some(StepPlan::compute(&launch.run, n, launch.nproc_per_node)))
        }
        DatasetSource::Registry(_) => (None, None),
    };

    let backend = match &preflight.backend {
        Some((path, cfg)) => Some((path, cfg.zero_stage(), cfg.resolve(launch)?)),
        None => None,
    };

    if args.json {
        let out = json!({
            "procedure": launcher.procedure_id(),
            "nproc_per_node": launch.nproc_per_node,
            "available_devices": preflight.available_devices,
            "effective_batch_size": preflight.effective_batch_size,
            "num_samples": num_samples,
            "steps": steps,
            "backend": backend.as_ref().map(|(path, stage, resolved)| json!({
                "path": path,
                "zero_stage": stage,
                "resolved": resolved,
            })),
            "run": launch.run,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", "Launch Plan".bold().cyan());
    println!();
    println!("  Model:                {}", launch.run.model_name_or_path);
    println!("  Data:                 {}", launch.run.data_path);
    println!("  Output:               {}", launch.run.output_dir.display());
    println!("  Procedure:            {}", launcher.procedure_id());
    println!(
        "  Devices:              {} of {} available",
        launch.nproc_per_node, preflight.available_devices
    );
    println!(
        "  Effective batch size: {} ({} × {} × {})",
        preflight.effective_batch_size.to_string().green(),
        launch.run.per_device_train_batch_size,
        launch.run.gradient_accumulation_steps,
        launch.nproc_per_node
    );
    println!("  Precision:            {}", launch.run.precision);
    println!("  Schedule:             {} (lr {})", launch.run.lr_scheduler_type, launch.run.learning_rate);

    match (num_samples, steps) {
        (Some(n), Some(steps)) => {
            println!("  Samples:              {}", n);
            println!(
                "  Steps:                {} ({} per epoch, {} warmup)",
                steps.total_steps.to_string().green(),
                steps.steps_per_epoch,
                steps.warmup_steps
            );
        }
        _ => println!("  Steps:                {}", "unknown (dataset is not a local file)".dimmed()),
    }

    if let Some(ckpt) = &launch.run.resume_from_checkpoint {
        println!("  Resume from:          {}", ckpt.display());
    }

    if let Some((path, stage, resolved)) = backend {
        println!();
        println!("{}", format!("Backend config ({}, ZeRO stage {})", path.display(), stage).bold());
        println!("{}", serde_json::to_string_pretty(&resolved)?);
    }
    println!();
    Ok(())
}
