//! Reference training procedure.
//!
//! Walks the same step schedule a data-parallel trainer would (learning-rate
//! schedule, periodic logging, checkpoint save and rotation, resume, final
//! save) with a surrogate loss in place of real forward/backward passes.
//! Only rank 0 writes to the output directory.

use crate::artifacts::{
    make_artifact, read_json, write_json, ArtifactKind, LogEntry, RunId, TrainerState, TrainingManifest,
    TrainingMetrics,
};
use crate::config::{Precision, RunConfig};
use crate::dataset::{
    compute_dataset_id, read_jsonl_records, validate_records, DatasetId, DatasetSource, DEFAULT_EOS_TOKEN,
};
use crate::error::{LaunchError, LaunchResult};
use crate::launcher::RUN_ID_ENV;
use crate::layout::OutputLayout;
use crate::scheduler::{LrSchedule, StepPlan};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Where this process sits in the distributed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerContext {
    pub rank: usize,
    pub world_size: usize,
    pub run_id: RunId,
}

impl WorkerContext {
    /// Read rank and world size from the launcher's environment.
    ///
    /// An explicit `--local-rank` wins over `LOCAL_RANK`; a bare invocation is
    /// rank 0 of 1.
    pub fn from_env(local_rank: Option<usize>) -> LaunchResult<Self> {
        let rank = match local_rank {
            Some(r) => r,
            None => env_usize("LOCAL_RANK")?.unwrap_or(0),
        };
        let world_size = env_usize("WORLD_SIZE")?.unwrap_or(1);
        if rank >= world_size {
            return Err(LaunchError::Other(anyhow::anyhow!("rank {rank} is outside world size {world_size}")));
        }
        let run_id = std::env::var(RUN_ID_ENV).map(RunId).unwrap_or_default();
        Ok(Self { rank, world_size, run_id })
    }

    #[must_use]
    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }
}

fn env_usize(key: &str) -> LaunchResult<Option<usize>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| LaunchError::Other(anyhow::anyhow!("{key}={raw:?} is not a non-negative integer"))),
        Err(_) => Ok(None),
    }
}

/// Stand-in for saved weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub base_model: String,
    pub global_step: u64,
    pub precision: Precision,
    pub attn_implementation: String,
    pub gradient_checkpointing: bool,
    pub max_length: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSummary {
    pub rank: usize,
    pub global_step: u64,
    pub total_steps: u64,
    pub resumed_from: Option<u64>,
    pub final_loss: f64,
    pub checkpoints_saved: Vec<u64>,
}

/// Deterministic loss curve: exponential decay plus seeded jitter.
fn surrogate_loss(step: u64, total: u64, seed: u64) -> f64 {
    let progress = step as f64 / total.max(1) as f64;
    let jitter = (splitmix64(seed ^ step) >> 11) as f64 / (1u64 << 53) as f64;
    0.3 + 2.2 * (-3.0 * progress).exp() + (jitter - 0.5) * 0.04
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

fn load_dataset(config: &RunConfig, base_dir: &Path) -> LaunchResult<(u64, DatasetId)> {
    let path = match DatasetSource::from_identifier(&config.data_path, base_dir) {
        DatasetSource::Local(path) => path,
        DatasetSource::Registry(name) => {
            return Err(LaunchError::Dataset(format!(
                "{name:?} is not a local JSONL file; the reference worker does not download datasets"
            )));
        }
    };
    let records = read_jsonl_records(&path)?;
    validate_records(&records)?;
    if let Some(first) = records.first() {
        let example = first.render(DEFAULT_EOS_TOKEN);
        tracing::debug!(prompt = %example.prompt, target = %example.target, "sample 0 of the training set");
    }
    Ok((records.len() as u64, compute_dataset_id(&records)?))
}

fn model_snapshot(config: &RunConfig, global_step: u64) -> ModelSnapshot {
    ModelSnapshot {
        base_model: config.model_name_or_path.clone(),
        global_step,
        precision: config.precision,
        attn_implementation: if config.use_flash_attention { "flash_attention_2" } else { "eager" }.to_string(),
        gradient_checkpointing: config.gradient_checkpointing,
        max_length: config.model_max_length,
    }
}

fn save_state(dir: &Path, config: &RunConfig, state: &TrainerState) -> LaunchResult<()> {
    std::fs::create_dir_all(dir)?;
    write_json(&OutputLayout::trainer_state_path(dir), state)?;
    write_json(&OutputLayout::run_config_path(dir), config)?;
    write_json(&OutputLayout::model_path(dir), &model_snapshot(config, state.global_step))?;
    Ok(())
}

/// Run the reference training loop for one rank.
///
/// `base_dir` resolves a relative `data_path`.
pub fn run_worker(config: &RunConfig, ctx: &WorkerContext, base_dir: &Path) -> LaunchResult<WorkerSummary> {
    tracing::info!("rank {}/{} ready", ctx.rank, ctx.world_size);

    let (num_samples, dataset_id) = load_dataset(config, base_dir)?;
    let plan = StepPlan::compute(config, num_samples, ctx.world_size);
    let schedule = LrSchedule::for_run(config, &plan);
    let layout = OutputLayout::new(&config.output_dir);

    if ctx.is_main_process() {
        tracing::info!(
            samples = num_samples,
            total_steps = plan.total_steps,
            warmup_steps = plan.warmup_steps,
            effective_batch_size = config.effective_batch_size(ctx.world_size),
            optim = %config.optim,
            "training plan"
        );
    }

    let mut state = TrainerState {
        run_id: ctx.run_id.clone(),
        global_step: 0,
        max_steps: plan.total_steps,
        epoch: 0.0,
        world_size: ctx.world_size,
        log_history: Vec::new(),
    };
    let mut resumed_from = None;

    if let Some(ref ckpt) = config.resume_from_checkpoint {
        let saved: TrainerState = read_json(&OutputLayout::trainer_state_path(ckpt)).map_err(|e| {
            LaunchError::Other(anyhow::anyhow!("cannot resume from {}: {e}", ckpt.display()))
        })?;
        if saved.world_size != ctx.world_size {
            tracing::warn!(saved = saved.world_size, current = ctx.world_size, "resuming with a different world size");
        }
        state.global_step = saved.global_step.min(plan.total_steps);
        state.epoch = plan.epoch_at(state.global_step);
        state.log_history = saved.log_history;
        resumed_from = Some(state.global_step);
        if ctx.is_main_process() {
            tracing::info!(step = state.global_step, "resumed from {}", ckpt.display());
        }
    }

    let mut checkpoints_saved = Vec::new();
    let mut loss = f64::NAN;

    while state.global_step < plan.total_steps {
        let lr = schedule.lr_at(state.global_step);
        state.global_step += 1;
        state.epoch = plan.epoch_at(state.global_step);
        loss = surrogate_loss(state.global_step, plan.total_steps, config.seed);

        if !ctx.is_main_process() {
            continue;
        }

        if state.global_step % config.logging_steps == 0 {
            tracing::info!(
                "step {}/{} loss {loss:.4} lr {lr:.3e} epoch {:.2}",
                state.global_step,
                plan.total_steps,
                state.epoch
            );
            state.log_history.push(LogEntry { step: state.global_step, epoch: state.epoch, loss, learning_rate: lr });
        }

        if state.global_step % config.save_steps == 0 {
            let dir = layout.checkpoint_dir(state.global_step);
            save_state(&dir, config, &state)?;
            checkpoints_saved.push(state.global_step);
            tracing::info!("saved {}", dir.display());
            for removed in layout.rotate_checkpoints(config.save_total_limit as usize)? {
                tracing::info!("deleted older checkpoint {}", removed.path.display());
            }
        }
    }

    if ctx.is_main_process() {
        save_state(layout.root(), config, &state)?;
        write_manifest(config, ctx, &layout, &state, dataset_id, loss)?;
        tracing::info!("final checkpoint written to {}", layout.root().display());
    }

    tracing::info!("rank {} done", ctx.rank);
    Ok(WorkerSummary {
        rank: ctx.rank,
        global_step: state.global_step,
        total_steps: plan.total_steps,
        resumed_from,
        final_loss: loss,
        checkpoints_saved,
    })
}

fn write_manifest(
    config: &RunConfig,
    ctx: &WorkerContext,
    layout: &OutputLayout,
    state: &TrainerState,
    dataset_id: DatasetId,
    loss: f64,
) -> LaunchResult<()> {
    let root = layout.root();
    let artifacts = vec![
        make_artifact(ArtifactKind::FinalCheckpoint, OutputLayout::model_path(root))?,
        make_artifact(ArtifactKind::TrainerState, OutputLayout::trainer_state_path(root))?,
        make_artifact(ArtifactKind::RunConfig, OutputLayout::run_config_path(root))?,
    ];
    let manifest = TrainingManifest {
        run_id: ctx.run_id.clone(),
        created_at: chrono::Utc::now(),
        base_model: config.model_name_or_path.clone(),
        dataset_id: Some(dataset_id),
        world_size: ctx.world_size,
        config: config.clone(),
        metrics: TrainingMetrics {
            train_loss: loss.is_finite().then_some(loss),
            steps: Some(state.global_step),
            epochs: Some(state.epoch),
        },
        artifacts,
    };
    write_json(&layout.manifest_path(), &manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::assemble;
    use tempfile::TempDir;

    fn write_dataset(dir: &Path, n: usize) {
        let lines: String = (0..n)
            .map(|i| format!("{{\"instruction\":\"mov eax, {i}\",\"output\":\"return {i};\"}}\n"))
            .collect();
        std::fs::write(dir.join("train.jsonl"), lines).unwrap();
    }

    fn config(temp: &TempDir, extra: &[(&str, &str)]) -> RunConfig {
        let mut pairs = vec![("model_name_or_path", "tiny-model"), ("data_path", "train.jsonl"), ("output_dir", "out")];
        pairs.extend_from_slice(extra);
        assemble(pairs, temp.path()).unwrap()
    }

    fn ctx(rank: usize, world_size: usize) -> WorkerContext {
        WorkerContext { rank, world_size, run_id: RunId("test-run".to_string()) }
    }

    #[test]
    fn test_rank_zero_saves_rotates_and_finalizes() {
        let temp = TempDir::new().unwrap();
        write_dataset(temp.path(), 64);
        // 64 samples, 1 rank, batch 4, accumulation 2: 8 steps/epoch, 16 total.
        let cfg = config(
            &temp,
            &[
                ("num_train_epochs", "2"),
                ("per_device_train_batch_size", "4"),
                ("gradient_accumulation_steps", "2"),
                ("save_steps", "3"),
                ("save_total_limit", "2"),
                ("logging_steps", "4"),
            ],
        );

        let summary = run_worker(&cfg, &ctx(0, 1), temp.path()).unwrap();
        assert_eq!(summary.total_steps, 16);
        assert_eq!(summary.global_step, 16);
        assert_eq!(summary.checkpoints_saved, vec![3, 6, 9, 12, 15]);

        let layout = OutputLayout::new(&cfg.output_dir);
        let remaining: Vec<u64> = layout.list_checkpoints().unwrap().iter().map(|c| c.step).collect();
        assert_eq!(remaining, vec![12, 15]);

        let state: TrainerState = read_json(&OutputLayout::trainer_state_path(layout.root())).unwrap();
        assert_eq!(state.global_step, 16);
        assert_eq!(state.log_history.iter().map(|l| l.step).collect::<Vec<_>>(), vec![4, 8, 12, 16]);

        let manifest: TrainingManifest = read_json(&layout.manifest_path()).unwrap();
        assert_eq!(manifest.artifacts.len(), 3);
        assert_eq!(manifest.config, cfg);
    }

    #[test]
    fn test_non_main_rank_writes_nothing() {
        let temp = TempDir::new().unwrap();
        write_dataset(temp.path(), 16);
        let cfg = config(&temp, &[("save_steps", "1")]);

        let summary = run_worker(&cfg, &ctx(1, 2), temp.path()).unwrap();
        assert!(summary.checkpoints_saved.is_empty());
        assert!(!cfg.output_dir.exists());
    }

    #[test]
    fn test_resume_continues_from_saved_step() {
        let temp = TempDir::new().unwrap();
        write_dataset(temp.path(), 32);
        let cfg = config(&temp, &[("num_train_epochs", "1"), ("per_device_train_batch_size", "2"), ("save_steps", "5")]);

        run_worker(&cfg, &ctx(0, 1), temp.path()).unwrap();
        let layout = OutputLayout::new(&cfg.output_dir);
        let latest = layout.latest_checkpoint().unwrap().unwrap();
        assert_eq!(latest.step, 15);

        let resumed = cfg.with_resume_from(Some(layout.checkpoint_dir(10)));
        let summary = run_worker(&resumed, &ctx(0, 1), temp.path()).unwrap();
        assert_eq!(summary.resumed_from, Some(10));
        assert_eq!(summary.global_step, 16);
        assert_eq!(summary.checkpoints_saved, vec![15]);
    }

    #[test]
    fn test_registry_dataset_is_rejected() {
        let temp = TempDir::new().unwrap();
        let mut cfg = config(&temp, &[]);
        cfg.data_path = "org/some-dataset".to_string();
        let err = run_worker(&cfg, &ctx(0, 1), temp.path()).unwrap_err();
        assert!(matches!(err, LaunchError::Dataset(_)));
    }

    #[test]
    fn test_surrogate_loss_decreases() {
        assert!(surrogate_loss(1, 100, 42) > surrogate_loss(100, 100, 42));
        assert_eq!(surrogate_loss(7, 100, 42), surrogate_loss(7, 100, 42));
    }
}
