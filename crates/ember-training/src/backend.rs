//! Distributed-backend configuration file (DeepSpeed JSON schema).
//!
//! Only the keys the launcher has to reason about are typed; every other key
//! is carried through untouched in `extra`.

use crate::config::{LaunchConfig, Precision};
use crate::error::BackendConfigError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub type BackendResult<T> = std::result::Result<T, BackendConfigError>;

/// A value that is either set explicitly or left as `"auto"` for the trainer to fill.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AutoOr<T> {
    Auto(AutoMarker),
    Value(T),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoMarker {
    Auto,
}

impl<T: Copy> AutoOr<T> {
    #[must_use]
    pub fn explicit(&self) -> Option<T> {
        match self {
            Self::Auto(_) => None,
            Self::Value(v) => Some(*v),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrecisionSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<AutoOr<bool>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PrecisionSection {
    fn is_enabled(&self) -> Option<bool> {
        self.enabled.and_then(|e| e.explicit())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffloadDevice {
    None,
    Cpu,
    Nvme,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffloadSection {
    pub device: OffloadDevice,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OffloadSection {
    fn is_active(&self) -> bool {
        self.device != OffloadDevice::None
    }
}

/// Memory-optimization strategy (ZeRO).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZeroOptimization {
    #[serde(default)]
    pub stage: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offload_optimizer: Option<OffloadSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offload_param: Option<OffloadSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap_comm: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contiguous_gradients: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_batch_size: Option<AutoOr<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_micro_batch_size_per_gpu: Option<AutoOr<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gradient_accumulation_steps: Option<AutoOr<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gradient_clipping: Option<AutoOr<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fp16: Option<PrecisionSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bf16: Option<PrecisionSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zero_optimization: Option<ZeroOptimization>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BackendConfig {
    /// Read and parse the file; does not validate.
    pub fn load(path: &Path) -> BackendResult<Self> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendConfigError::NotFound(path.to_path_buf()));
            }
            Err(e) => {
                return Err(BackendConfigError::Malformed { path: path.to_path_buf(), reason: e.to_string() });
            }
        };
        Self::from_slice(&bytes, path)
    }

    pub fn from_slice(bytes: &[u8], origin: &Path) -> BackendResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| BackendConfigError::Malformed { path: origin.to_path_buf(), reason: e.to_string() })
    }

    #[must_use]
    pub fn zero_stage(&self) -> u8 {
        self.zero_optimization.as_ref().map_or(0, |z| z.stage)
    }

    /// Internal consistency of the document itself.
    pub fn validate(&self) -> BackendResult<()> {
        if let Some(ref zero) = self.zero_optimization {
            if zero.stage > 3 {
                return Err(BackendConfigError::Invalid(format!(
                    "zero_optimization.stage must be 0-3 (got {})",
                    zero.stage
                )));
            }
            if zero.offload_param.as_ref().is_some_and(OffloadSection::is_active) && zero.stage != 3 {
                return Err(BackendConfigError::Invalid(
                    "offload_param requires zero_optimization.stage 3".to_string(),
                ));
            }
            if zero.offload_optimizer.as_ref().is_some_and(OffloadSection::is_active) && zero.stage == 0 {
                return Err(BackendConfigError::Invalid(
                    "offload_optimizer requires zero_optimization.stage >= 1".to_string(),
                ));
            }
        }

        let fp16 = self.fp16.as_ref().and_then(PrecisionSection::is_enabled) == Some(true);
        let bf16 = self.bf16.as_ref().and_then(PrecisionSection::is_enabled) == Some(true);
        if fp16 && bf16 {
            return Err(BackendConfigError::Invalid("fp16 and bf16 cannot both be enabled".to_string()));
        }
        Ok(())
    }

    /// Every explicit (non-`auto`) value must agree with the launch configuration.
    pub fn check_against(&self, launch: &LaunchConfig) -> BackendResult<()> {
        let run = &launch.run;

        if let Some(micro) = self.train_micro_batch_size_per_gpu.and_then(|v| v.explicit()) {
            if micro != u64::from(run.per_device_train_batch_size) {
                return Err(BackendConfigError::Mismatch(format!(
                    "train_micro_batch_size_per_gpu={micro} but per_device_train_batch_size={}",
                    run.per_device_train_batch_size
                )));
            }
        }
        if let Some(accum) = self.gradient_accumulation_steps.and_then(|v| v.explicit()) {
            if accum != u64::from(run.gradient_accumulation_steps) {
                return Err(BackendConfigError::Mismatch(format!(
                    "gradient_accumulation_steps={accum} but run uses {}",
                    run.gradient_accumulation_steps
                )));
            }
        }
        if let Some(total) = self.train_batch_size.and_then(|v| v.explicit()) {
            let effective = launch.effective_batch_size();
            if total != effective {
                return Err(BackendConfigError::Mismatch(format!(
                    "train_batch_size={total} but effective batch size is {effective}"
                )));
            }
        }

        for (name, section, mode) in
            [("fp16", &self.fp16, Precision::Fp16), ("bf16", &self.bf16, Precision::Bf16)]
        {
            if let Some(enabled) = section.as_ref().and_then(PrecisionSection::is_enabled) {
                if enabled != (run.precision == mode) {
                    return Err(BackendConfigError::Mismatch(format!(
                        "{name}.enabled={enabled} but precision is {}",
                        run.precision
                    )));
                }
            }
        }
        Ok(())
    }

    /// The document with every `"auto"` replaced by the launch configuration's value.
    pub fn resolve(&self, launch: &LaunchConfig) -> BackendResult<Value> {
        let run = &launch.run;
        let mut resolved = self.clone();

        if matches!(resolved.train_batch_size, Some(AutoOr::Auto(_))) {
            resolved.train_batch_size = Some(AutoOr::Value(launch.effective_batch_size()));
        }
        if matches!(resolved.train_micro_batch_size_per_gpu, Some(AutoOr::Auto(_))) {
            resolved.train_micro_batch_size_per_gpu =
                Some(AutoOr::Value(u64::from(run.per_device_train_batch_size)));
        }
        if matches!(resolved.gradient_accumulation_steps, Some(AutoOr::Auto(_))) {
            resolved.gradient_accumulation_steps = Some(AutoOr::Value(u64::from(run.gradient_accumulation_steps)));
        }
        if matches!(resolved.gradient_clipping, Some(AutoOr::Auto(_))) {
            // Trainer default max_grad_norm.
            resolved.gradient_clipping = Some(AutoOr::Value(1.0));
        }
        for (section, mode) in [(&mut resolved.fp16, Precision::Fp16), (&mut resolved.bf16, Precision::Bf16)] {
            if let Some(sec) = section.as_mut() {
                if matches!(sec.enabled, Some(AutoOr::Auto(_))) {
                    sec.enabled = Some(AutoOr::Value(run.precision == mode));
                }
            }
        }

        serde_json::to_value(&resolved)
            .map_err(|e| BackendConfigError::Invalid(format!("failed to serialize resolved config: {e}")))
    }
}

/// Load, validate and cross-check the backend file named by the run configuration.
pub fn preflight(launch: &LaunchConfig) -> BackendResult<Option<(PathBuf, BackendConfig)>> {
    let Some(ref path) = launch.run.deepspeed else {
        return Ok(None);
    };
    let config = BackendConfig::load(path)?;
    config.validate()?;
    config.check_against(launch)?;
    Ok(Some((path.clone(), config)))
}
