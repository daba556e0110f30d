//! `checkpoints`: list the checkpoints of a run, newest first.

use anyhow::{Context, Result};
use colored::Colorize;
use ember_training::artifacts::read_json;
use ember_training::{OutputLayout, TrainerState, TrainingManifest};
use serde_json::json;
use std::path::{Path, PathBuf};

struct Row {
    step: u64,
    path: PathBuf,
    epoch: Option<f64>,
    loss: Option<f64>,
}

fn load_rows(layout: &OutputLayout) -> Result<Vec<Row>> {
    let mut entries = layout
        .list_checkpoints()
        .with_context(|| format!("Failed to list checkpoints in {}", layout.root().display()))?;
    entries.reverse();

    Ok(entries
        .into_iter()
        .map(|entry| {
            // A half-written checkpoint still gets listed, just without stats.
            let state = read_json::<TrainerState>(&OutputLayout::trainer_state_path(&entry.path)).ok();
            Row {
                step: entry.step,
                epoch: state.as_ref().map(|s| s.epoch),
                loss: state.as_ref().and_then(|s| s.log_history.last()).map(|l| l.loss),
                path: entry.path,
            }
        })
        .collect())
}

fn load_manifest(layout: &OutputLayout) -> Option<TrainingManifest> {
    let path = layout.manifest_path();
    if !path.is_file() {
        return None;
    }
    match read_json(&path) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            tracing::warn!("ignoring unreadable manifest {}: {}", path.display(), e);
            None
        }
    }
}

pub async fn execute(output_dir: PathBuf, json_output: bool, workspace: &Path) -> Result<()> {
    let root = if output_dir.is_absolute() { output_dir } else { workspace.join(output_dir) };
    let layout = OutputLayout::new(&root);
    let rows = load_rows(&layout)?;
    let manifest = load_manifest(&layout);

    if json_output {
        let out = json!({
            "output_dir": layout.root(),
            "checkpoints": rows.iter().map(|r| json!({
                "step": r.step,
                "path": r.path,
                "epoch": r.epoch,
                "loss": r.loss,
            })).collect::<Vec<_>>(),
            "final": manifest.as_ref().map(|m| json!({
                "run_id": m.run_id,
                "created_at": m.created_at,
                "steps": m.metrics.steps,
                "train_loss": m.metrics.train_loss,
            })),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Checkpoints ({})", rows.len()).bold().cyan());
    println!();

    if rows.is_empty() {
        println!("  {}", format!("No checkpoints found in {}.", layout.root().display()).dimmed());
    } else {
        println!("{:<8} {:<8} {:<10} {}", "Step", "Epoch", "Loss", "Path");
        println!("{}", "─".repeat(80));
        for row in &rows {
            let epoch = row.epoch.map_or_else(|| "-".to_string(), |e| format!("{e:.2}"));
            let loss = row.loss.map_or_else(|| "-".to_string(), |l| format!("{l:.4}"));
            println!(
                "{:<8} {:<8} {:<10} {}",
                row.step.to_string().cyan(),
                epoch,
                loss,
                row.path.display().to_string().dimmed()
            );
        }
    }

    if let Some(manifest) = manifest {
        println!();
        println!(
            "  {} final checkpoint from run {} ({})",
            "✓".green(),
            manifest.run_id,
            manifest.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    println!();
    Ok(())
}
