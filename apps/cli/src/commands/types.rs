//! Argument types shared by the launch, plan and worker commands.

use clap::Args;
use std::path::PathBuf;

/// Run configuration flags.
///
/// Values stay raw strings here; range and type checks happen once, in
/// `ember_training::assemble`, so every entry point reports the same errors.
/// Each flag also accepts its Hugging Face spelling (`--per_device_train_batch_size`).
#[derive(Args, Debug, Clone, Default)]
pub struct RunOptions {
    /// Pretrained checkpoint: local path or hub name
    #[arg(long, alias = "model_name_or_path", value_name = "MODEL")]
    pub model_name_or_path: Option<String>,

    /// Training data: local JSONL path or hub dataset name
    #[arg(long, alias = "data_path", value_name = "DATA")]
    pub data_path: Option<String>,

    /// Directory that receives checkpoints (relative to the workspace)
    #[arg(long, alias = "output_dir", value_name = "DIR")]
    pub output_dir: Option<String>,

    #[arg(long, alias = "num_train_epochs", allow_hyphen_values = true, value_name = "N")]
    pub num_train_epochs: Option<String>,

    /// Maximum sequence length (truncation/padding bound)
    #[arg(long, alias = "model_max_length", allow_hyphen_values = true, value_name = "N")]
    pub model_max_length: Option<String>,

    #[arg(long, alias = "per_device_train_batch_size", allow_hyphen_values = true, value_name = "N")]
    pub per_device_train_batch_size: Option<String>,

    #[arg(long, alias = "gradient_accumulation_steps", allow_hyphen_values = true, value_name = "N")]
    pub gradient_accumulation_steps: Option<String>,

    #[arg(long, alias = "learning_rate", allow_hyphen_values = true, value_name = "LR")]
    pub learning_rate: Option<String>,

    /// linear, cosine, constant, constant_with_warmup, polynomial
    #[arg(long, alias = "lr_scheduler_type", value_name = "KIND")]
    pub lr_scheduler_type: Option<String>,

    /// Fraction of total steps spent warming up, in [0, 1)
    #[arg(long, alias = "warmup_ratio", allow_hyphen_values = true, value_name = "RATIO")]
    pub warmup_ratio: Option<String>,

    /// Save a checkpoint every N optimizer steps
    #[arg(long, alias = "save_steps", allow_hyphen_values = true, value_name = "N")]
    pub save_steps: Option<String>,

    /// Keep at most N checkpoints; older ones are deleted
    #[arg(long, alias = "save_total_limit", allow_hyphen_values = true, value_name = "N")]
    pub save_total_limit: Option<String>,

    #[arg(long, alias = "logging_steps", allow_hyphen_values = true, value_name = "N")]
    pub logging_steps: Option<String>,

    /// fp32, fp16 or bf16
    #[arg(long, value_name = "MODE")]
    pub precision: Option<String>,

    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    pub bf16: Option<String>,

    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    pub fp16: Option<String>,

    /// Trade compute for memory
    #[arg(long, alias = "gradient_checkpointing", num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    pub gradient_checkpointing: Option<String>,

    /// Request the flash-attention kernel from the training procedure
    #[arg(long, alias = "use_flash_attention", num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    pub use_flash_attention: Option<String>,

    #[arg(long, allow_hyphen_values = true, value_name = "N")]
    pub seed: Option<String>,

    #[arg(long, alias = "weight_decay", allow_hyphen_values = true, value_name = "WD")]
    pub weight_decay: Option<String>,

    /// Distributed-backend (DeepSpeed) JSON config
    #[arg(long, value_name = "FILE")]
    pub deepspeed: Option<String>,

    #[arg(long, alias = "resume_from_checkpoint", value_name = "DIR")]
    pub resume_from_checkpoint: Option<String>,

    /// Optimizer name understood by the training script (default adamw_torch)
    #[arg(long, value_name = "NAME")]
    pub optim: Option<String>,

    /// Download cache for models and datasets
    #[arg(long, alias = "cache_dir", value_name = "DIR")]
    pub cache_dir: Option<String>,

    /// Experiment trackers to report to, e.g. wandb or none
    #[arg(long, alias = "report_to", value_name = "TRACKERS")]
    pub report_to: Option<String>,
}

impl RunOptions {
    /// Flags that were actually given, as `(option, raw value)` pairs.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let fields: [(&'static str, &Option<String>); 25] = [
            ("model_name_or_path", &self.model_name_or_path),
            ("data_path", &self.data_path),
            ("output_dir", &self.output_dir),
            ("num_train_epochs", &self.num_train_epochs),
            ("model_max_length", &self.model_max_length),
            ("per_device_train_batch_size", &self.per_device_train_batch_size),
            ("gradient_accumulation_steps", &self.gradient_accumulation_steps),
            ("learning_rate", &self.learning_rate),
            ("lr_scheduler_type", &self.lr_scheduler_type),
            ("warmup_ratio", &self.warmup_ratio),
            ("save_steps", &self.save_steps),
            ("save_total_limit", &self.save_total_limit),
            ("logging_steps", &self.logging_steps),
            ("precision", &self.precision),
            ("bf16", &self.bf16),
            ("fp16", &self.fp16),
            ("gradient_checkpointing", &self.gradient_checkpointing),
            ("use_flash_attention", &self.use_flash_attention),
            ("seed", &self.seed),
            ("weight_decay", &self.weight_decay),
            ("deepspeed", &self.deepspeed),
            ("resume_from_checkpoint", &self.resume_from_checkpoint),
            ("optim", &self.optim),
            ("cache_dir", &self.cache_dir),
            ("report_to", &self.report_to),
        ];
        fields.into_iter().filter_map(|(name, value)| value.clone().map(|v| (name, v))).collect()
    }
}

/// Arguments for `launch` and `plan`.
#[derive(Args, Debug, Clone)]
pub struct LaunchArgs {
    /// Processes (devices) to start on this node
    #[arg(long, alias = "nproc_per_node", value_name = "N")]
    pub nproc_per_node: Option<usize>,

    #[arg(long, value_name = "ADDR")]
    pub master_addr: Option<String>,

    #[arg(long, value_name = "PORT")]
    pub master_port: Option<u16>,

    /// Weights & Biases project exported to every rank as WANDB_PROJECT
    #[arg(long, alias = "wandb_project", value_name = "PROJECT")]
    pub wandb_project: Option<String>,

    /// Extra TOML file with `[run]` / `[launch]` tables
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// External training program (default: the bundled reference worker)
    #[arg(long, value_name = "PROGRAM")]
    pub trainer: Option<String>,

    /// Argument passed to the trainer before the run flags (repeatable)
    #[arg(long = "trainer-arg", allow_hyphen_values = true, value_name = "ARG")]
    pub trainer_args: Vec<String>,

    /// Allow running without accelerators (one CPU process per rank)
    #[arg(long)]
    pub allow_cpu: bool,

    /// Resume from the newest checkpoint in the output directory
    #[arg(long)]
    pub resume: bool,

    #[command(flatten)]
    pub run: RunOptions,
}

/// Arguments for `plan`.
#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub launch: LaunchArgs,
}

/// Arguments for the bundled reference worker.
///
/// The worker takes the same Hugging Face style flags an external training
/// script receives (`--local_rank=R --learning_rate 2e-5 --bf16 ...`), so it
/// reads them raw instead of through clap.
#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Run flags plus `--local-rank R` (the rank defaults to $LOCAL_RANK)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "FLAGS")]
    pub flags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_pairs_skips_absent_flags() {
        let opts = RunOptions {
            data_path: Some("train.jsonl".to_string()),
            bf16: Some("true".to_string()),
            ..RunOptions::default()
        };
        assert_eq!(
            opts.to_pairs(),
            vec![("data_path", "train.jsonl".to_string()), ("bf16", "true".to_string())]
        );
    }
}
