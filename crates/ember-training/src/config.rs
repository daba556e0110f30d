//! Run configuration and its assembly from `(option, value)` pairs.
//!
//! Option names follow the Hugging Face `TrainingArguments` spelling so the
//! same pairs can be forwarded verbatim to an external training script.
//! Hyphens and underscores are interchangeable, and a leading `--` is ignored.

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

/// Every option name accepted by [`assemble`].
pub const KNOWN_OPTIONS: &[&str] = &[
    "model_name_or_path",
    "data_path",
    "output_dir",
    "num_train_epochs",
    "model_max_length",
    "per_device_train_batch_size",
    "gradient_accumulation_steps",
    "learning_rate",
    "lr_scheduler_type",
    "warmup_ratio",
    "save_steps",
    "save_total_limit",
    "logging_steps",
    "precision",
    "bf16",
    "fp16",
    "gradient_checkpointing",
    "use_flash_attention",
    "seed",
    "weight_decay",
    "deepspeed",
    "resume_from_checkpoint",
    "optim",
    "cache_dir",
    "report_to",
];

/// Options that together decide the precision; a layer naming any of them
/// replaces all of them.
pub const PRECISION_OPTIONS: &[&str] = &["precision", "bf16", "fp16"];

pub const DEFAULT_OPTIM: &str = "adamw_torch";

/// Learning rate the `polynomial` schedule decays to.
pub const POLYNOMIAL_END_LR: f64 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Fp32,
    Fp16,
    Bf16,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fp32 => "fp32",
            Self::Fp16 => "fp16",
            Self::Bf16 => "bf16",
        };
        f.write_str(s)
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fp32" | "float32" | "no" => Ok(Self::Fp32),
            "fp16" | "float16" | "half" => Ok(Self::Fp16),
            "bf16" | "bfloat16" => Ok(Self::Bf16),
            other => Err(format!("expected one of fp32, fp16, bf16 (got {other})")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedulerKind {
    Linear,
    Cosine,
    Constant,
    ConstantWithWarmup,
    Polynomial,
}

impl fmt::Display for LrSchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Linear => "linear",
            Self::Cosine => "cosine",
            Self::Constant => "constant",
            Self::ConstantWithWarmup => "constant_with_warmup",
            Self::Polynomial => "polynomial",
        };
        f.write_str(s)
    }
}

impl FromStr for LrSchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "linear" => Ok(Self::Linear),
            "cosine" => Ok(Self::Cosine),
            "constant" => Ok(Self::Constant),
            "constant_with_warmup" => Ok(Self::ConstantWithWarmup),
            "polynomial" => Ok(Self::Polynomial),
            other => Err(format!(
                "expected one of linear, cosine, constant, constant_with_warmup, polynomial (got {other})"
            )),
        }
    }
}

/// Immutable configuration for one fine-tuning run.
///
/// Built once by [`assemble`] and handed by reference to the launcher and
/// every training procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub model_name_or_path: String,
    pub data_path: String,
    pub output_dir: PathBuf,
    pub num_train_epochs: u32,
    pub model_max_length: u32,
    pub per_device_train_batch_size: u32,
    pub gradient_accumulation_steps: u32,
    pub learning_rate: f64,
    pub lr_scheduler_type: LrSchedulerKind,
    pub warmup_ratio: f64,
    pub save_steps: u64,
    pub save_total_limit: u32,
    pub logging_steps: u64,
    pub precision: Precision,
    pub gradient_checkpointing: bool,
    pub use_flash_attention: bool,
    pub seed: u64,
    pub weight_decay: f64,
    pub deepspeed: Option<PathBuf>,
    pub resume_from_checkpoint: Option<PathBuf>,
    pub optim: String,
    pub cache_dir: Option<PathBuf>,
    /// Experiment trackers (`wandb`, `tensorboard`, `none`, ...), passed through untouched.
    pub report_to: Option<String>,
}

impl RunConfig {
    /// Per-device batch × accumulation steps × device count.
    #[must_use]
    pub fn effective_batch_size(&self, devices: usize) -> u64 {
        u64::from(self.per_device_train_batch_size)
            * u64::from(self.gradient_accumulation_steps)
            * devices as u64
    }

    /// Canonical option pairs, suitable for forwarding to a training script.
    ///
    /// Assembling these pairs again yields an equal configuration. Precision is
    /// rendered as the `bf16` / `fp16` flags that training scripts understand.
    #[must_use]
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("model_name_or_path", self.model_name_or_path.clone()),
            ("data_path", self.data_path.clone()),
            ("output_dir", self.output_dir.display().to_string()),
            ("num_train_epochs", self.num_train_epochs.to_string()),
            ("model_max_length", self.model_max_length.to_string()),
            ("per_device_train_batch_size", self.per_device_train_batch_size.to_string()),
            ("gradient_accumulation_steps", self.gradient_accumulation_steps.to_string()),
            ("learning_rate", self.learning_rate.to_string()),
            ("lr_scheduler_type", self.lr_scheduler_type.to_string()),
            ("warmup_ratio", self.warmup_ratio.to_string()),
            ("save_steps", self.save_steps.to_string()),
            ("save_total_limit", self.save_total_limit.to_string()),
            ("logging_steps", self.logging_steps.to_string()),
            ("bf16", (self.precision == Precision::Bf16).to_string()),
            ("fp16", (self.precision == Precision::Fp16).to_string()),
            ("gradient_checkpointing", self.gradient_checkpointing.to_string()),
            ("use_flash_attention", self.use_flash_attention.to_string()),
            ("seed", self.seed.to_string()),
            ("weight_decay", self.weight_decay.to_string()),
            ("optim", self.optim.clone()),
        ];
        if let Some(ref ds) = self.deepspeed {
            pairs.push(("deepspeed", ds.display().to_string()));
        }
        if let Some(ref ckpt) = self.resume_from_checkpoint {
            pairs.push(("resume_from_checkpoint", ckpt.display().to_string()));
        }
        if let Some(ref cache) = self.cache_dir {
            pairs.push(("cache_dir", cache.display().to_string()));
        }
        if let Some(ref report_to) = self.report_to {
            pairs.push(("report_to", report_to.clone()));
        }
        pairs
    }

    /// Same configuration with a different resume point.
    #[must_use]
    pub fn with_resume_from(&self, checkpoint: Option<PathBuf>) -> Self {
        Self { resume_from_checkpoint: checkpoint, ..self.clone() }
    }
}

/// Normalize `--per-device-train-batch-size` to `per_device_train_batch_size`.
#[must_use]
pub fn normalize_option_name(name: &str) -> String {
    name.trim().trim_start_matches('-').replace('-', "_").to_ascii_lowercase()
}

/// Accumulates raw option values; later values override earlier ones.
#[derive(Debug, Default, Clone)]
pub struct RunConfigBuilder {
    values: Vec<(String, String)>,
}

impl RunConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one raw option. Unknown names are rejected immediately.
    pub fn set(&mut self, name: &str, value: &str) -> ConfigResult<&mut Self> {
        let name = normalize_option_name(name);
        if !KNOWN_OPTIONS.contains(&name.as_str()) {
            return Err(ConfigError::UnknownOption(name));
        }
        self.values.retain(|(k, _)| *k != name);
        self.values.push((name, value.trim().to_string()));
        Ok(self)
    }

    /// Record one configuration layer on top of the earlier ones.
    ///
    /// Options the layer names replace earlier values. Naming any precision
    /// option replaces the whole precision group, so `--precision fp16`
    /// overrides a file's `bf16 = true` instead of conflicting with it.
    pub fn layer<I, K, V>(&mut self, pairs: I) -> ConfigResult<&mut Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let pairs: Vec<(String, String)> =
            pairs.into_iter().map(|(k, v)| (normalize_option_name(k.as_ref()), v.as_ref().to_string())).collect();
        if pairs.iter().any(|(k, _)| PRECISION_OPTIONS.contains(&k.as_str())) {
            self.values.retain(|(k, _)| !PRECISION_OPTIONS.contains(&k.as_str()));
        }
        for (name, value) in &pairs {
            self.set(name, value)?;
        }
        Ok(self)
    }

    fn raw(&self, name: &str) -> Option<&str> {
        self.values.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// Validate and produce the immutable configuration.
    ///
    /// Relative paths are joined onto `workspace_root` lexically.
    pub fn build(&self, workspace_root: &Path) -> ConfigResult<RunConfig> {
        let model_name_or_path = self.required_string("model_name_or_path")?;
        let data_path = self.required_string("data_path")?;
        let output_dir = resolve_path(workspace_root, &self.required_string("output_dir")?);

        let warmup_ratio = self.parse_f64("warmup_ratio", 0.0)?;
        if !(0.0..1.0).contains(&warmup_ratio) {
            return Err(ConfigError::invalid(
                "warmup_ratio",
                self.raw("warmup_ratio").unwrap_or_default(),
                "must be in [0, 1)",
            ));
        }

        let learning_rate = self.parse_f64("learning_rate", 5e-5)?;
        if learning_rate <= 0.0 {
            return Err(ConfigError::invalid(
                "learning_rate",
                self.raw("learning_rate").unwrap_or_default(),
                "must be > 0",
            ));
        }

        let weight_decay = self.parse_f64("weight_decay", 0.0)?;
        if weight_decay < 0.0 {
            return Err(ConfigError::invalid(
                "weight_decay",
                self.raw("weight_decay").unwrap_or_default(),
                "must be >= 0",
            ));
        }

        let lr_scheduler_type = match self.raw("lr_scheduler_type") {
            Some(raw) => raw
                .parse::<LrSchedulerKind>()
                .map_err(|reason| ConfigError::invalid("lr_scheduler_type", raw, reason))?,
            None => LrSchedulerKind::Linear,
        };
        if lr_scheduler_type == LrSchedulerKind::Polynomial && learning_rate <= POLYNOMIAL_END_LR {
            return Err(ConfigError::Conflict(format!(
                "`lr_scheduler_type=polynomial` decays to {POLYNOMIAL_END_LR:e}; `learning_rate={learning_rate}` must be above it"
            )));
        }

        let optim = match self.raw("optim") {
            Some("") => return Err(ConfigError::invalid("optim", "", "must not be empty")),
            Some(raw) => raw.to_string(),
            None => DEFAULT_OPTIM.to_string(),
        };

        Ok(RunConfig {
            model_name_or_path,
            data_path,
            output_dir,
            num_train_epochs: self.parse_positive("num_train_epochs", 3)?,
            model_max_length: self.parse_positive("model_max_length", 512)?,
            per_device_train_batch_size: self.parse_positive("per_device_train_batch_size", 8)?,
            gradient_accumulation_steps: self.parse_positive("gradient_accumulation_steps", 1)?,
            learning_rate,
            lr_scheduler_type,
            warmup_ratio,
            save_steps: self.parse_positive("save_steps", 500)?,
            save_total_limit: self.parse_positive("save_total_limit", 3)?,
            logging_steps: self.parse_positive("logging_steps", 10)?,
            precision: self.resolve_precision()?,
            gradient_checkpointing: self.parse_bool("gradient_checkpointing")?.unwrap_or(false),
            use_flash_attention: self.parse_bool("use_flash_attention")?.unwrap_or(false),
            seed: self.parse_non_negative("seed", 42)?,
            weight_decay,
            deepspeed: self.optional_path(workspace_root, "deepspeed"),
            resume_from_checkpoint: self.optional_path(workspace_root, "resume_from_checkpoint"),
            optim,
            cache_dir: self.optional_path(workspace_root, "cache_dir"),
            report_to: self.raw("report_to").filter(|v| !v.is_empty()).map(str::to_string),
        })
    }

    fn required_string(&self, field: &'static str) -> ConfigResult<String> {
        match self.raw(field) {
            Some(v) if !v.is_empty() => Ok(v.to_string()),
            _ => Err(ConfigError::Missing { field }),
        }
    }

    fn optional_path(&self, workspace_root: &Path, field: &str) -> Option<PathBuf> {
        self.raw(field).filter(|v| !v.is_empty()).map(|v| resolve_path(workspace_root, v))
    }

    fn parse_positive<T>(&self, field: &str, default: T) -> ConfigResult<T>
    where
        T: TryFrom<i128>,
    {
        let Some(raw) = self.raw(field) else {
            return Ok(default);
        };
        let n: i128 = raw
            .parse()
            .map_err(|_| ConfigError::invalid(field, raw, "expected an integer"))?;
        if n <= 0 {
            return Err(ConfigError::invalid(field, raw, "must be a positive integer"));
        }
        T::try_from(n).map_err(|_| ConfigError::invalid(field, raw, "value is too large"))
    }

    fn parse_non_negative(&self, field: &str, default: u64) -> ConfigResult<u64> {
        let Some(raw) = self.raw(field) else {
            return Ok(default);
        };
        raw.parse::<u64>()
            .map_err(|_| ConfigError::invalid(field, raw, "expected a non-negative integer"))
    }

    fn parse_f64(&self, field: &str, default: f64) -> ConfigResult<f64> {
        let Some(raw) = self.raw(field) else {
            return Ok(default);
        };
        let v: f64 = raw.parse().map_err(|_| ConfigError::invalid(field, raw, "expected a number"))?;
        if !v.is_finite() {
            return Err(ConfigError::invalid(field, raw, "must be finite"));
        }
        Ok(v)
    }

    fn parse_bool(&self, field: &str) -> ConfigResult<Option<bool>> {
        self.raw(field)
            .map(|raw| parse_bool(raw).ok_or_else(|| ConfigError::invalid(field, raw, "expected a boolean")))
            .transpose()
    }

    fn resolve_precision(&self) -> ConfigResult<Precision> {
        let explicit = self
            .raw("precision")
            .map(|raw| raw.parse::<Precision>().map_err(|reason| ConfigError::invalid("precision", raw, reason)))
            .transpose()?;
        let bf16 = self.parse_bool("bf16")?;
        let fp16 = self.parse_bool("fp16")?;

        if bf16 == Some(true) && fp16 == Some(true) {
            return Err(ConfigError::Conflict("`bf16` and `fp16` cannot both be enabled".to_string()));
        }

        if let Some(p) = explicit {
            for (flag, value, mode) in [("bf16", bf16, Precision::Bf16), ("fp16", fp16, Precision::Fp16)] {
                if let Some(enabled) = value {
                    if enabled != (p == mode) {
                        return Err(ConfigError::Conflict(format!(
                            "`precision={p}` disagrees with `{flag}={enabled}`"
                        )));
                    }
                }
            }
            return Ok(p);
        }

        Ok(match (bf16, fp16) {
            (Some(true), _) => Precision::Bf16,
            (_, Some(true)) => Precision::Fp16,
            _ => Precision::Fp32,
        })
    }
}

/// Assemble a [`RunConfig`] from an ordered sequence of raw pairs.
pub fn assemble<I, K, V>(pairs: I, workspace_root: &Path) -> ConfigResult<RunConfig>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut builder = RunConfigBuilder::new();
    for (name, value) in pairs {
        builder.set(name.as_ref(), value.as_ref())?;
    }
    builder.build(workspace_root)
}

/// Assemble from configuration layers, lowest precedence first.
///
/// See [`RunConfigBuilder::layer`] for how a layer replaces earlier ones.
pub fn assemble_layers<L, I, K, V>(layers: L, workspace_root: &Path) -> ConfigResult<RunConfig>
where
    L: IntoIterator<Item = I>,
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut builder = RunConfigBuilder::new();
    for layer in layers {
        builder.layer(layer)?;
    }
    builder.build(workspace_root)
}

/// Split `--name value` / `--name=value` / bare `--flag` arguments into pairs.
///
/// A bare flag followed by another `--option` (or nothing) becomes `"true"`.
pub fn pairs_from_args<S: AsRef<str>>(args: &[S]) -> ConfigResult<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut iter = args.iter().map(AsRef::as_ref).peekable();
    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::invalid("arguments", arg, "expected an `--option`"));
        };
        if let Some((name, value)) = stripped.split_once('=') {
            pairs.push((normalize_option_name(name), value.to_string()));
            continue;
        }
        let value = match iter.peek() {
            Some(next) if !next.starts_with("--") => iter.next().unwrap_or_default().to_string(),
            _ => "true".to_string(),
        };
        pairs.push((normalize_option_name(stripped), value));
    }
    Ok(pairs)
}

#[must_use]
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" => Some(true),
        "false" | "0" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn resolve_path(workspace_root: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    let joined = if path.is_absolute() { path.to_path_buf() } else { workspace_root.join(path) };
    // Lexical cleanup only: no filesystem access.
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Run configuration plus the distributed launch parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub run: RunConfig,
    pub nproc_per_node: usize,
    pub master_addr: String,
    pub master_port: u16,
    pub workspace_root: PathBuf,
    /// Exported to every rank as `WANDB_PROJECT`.
    pub wandb_project: Option<String>,
}

impl LaunchConfig {
    pub const DEFAULT_MASTER_ADDR: &'static str = "127.0.0.1";
    pub const DEFAULT_MASTER_PORT: u16 = 29500;

    #[must_use]
    pub fn new(run: RunConfig, nproc_per_node: usize, workspace_root: PathBuf) -> Self {
        Self {
            run,
            nproc_per_node,
            master_addr: Self::DEFAULT_MASTER_ADDR.to_string(),
            master_port: Self::DEFAULT_MASTER_PORT,
            workspace_root,
            wandb_project: None,
        }
    }

    #[must_use]
    pub fn effective_batch_size(&self) -> u64 {
        self.run.effective_batch_size(self.nproc_per_node)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.nproc_per_node == 0 {
            return Err(ConfigError::invalid("nproc_per_node", "0", "must be a positive integer"));
        }
        if self.master_addr.trim().is_empty() {
            return Err(ConfigError::Missing { field: "master_addr" });
        }
        Ok(())
    }
}
