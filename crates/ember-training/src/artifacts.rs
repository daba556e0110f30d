use crate::config::RunConfig;
use crate::dataset::DatasetId;
use crate::error::{LaunchError, LaunchResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Identifier for one launch, shared by every rank.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    FinalCheckpoint,
    TrainerState,
    RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub sha256: String,
}

/// One periodic log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: u64,
    pub epoch: f64,
    pub loss: f64,
    pub learning_rate: f64,
}

/// Progress state saved with every checkpoint; resuming reads `global_step`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub run_id: RunId,
    pub global_step: u64,
    pub max_steps: u64,
    pub epoch: f64,
    pub world_size: usize,
    #[serde(default)]
    pub log_history: Vec<LogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrainingMetrics {
    pub train_loss: Option<f64>,
    pub steps: Option<u64>,
    pub epochs: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingManifest {
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    pub base_model: String,
    #[serde(default)]
    pub dataset_id: Option<DatasetId>,
    pub world_size: usize,
    pub config: RunConfig,
    #[serde(default)]
    pub metrics: TrainingMetrics,
    pub artifacts: Vec<TrainingArtifact>,
}

pub fn sha256_file(path: &Path) -> LaunchResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn make_artifact(kind: ArtifactKind, path: PathBuf) -> LaunchResult<TrainingArtifact> {
    if !path.exists() {
        return Err(LaunchError::Other(anyhow::anyhow!("artifact path does not exist: {}", path.display())));
    }

    let hash = sha256_file(&path)?;
    Ok(TrainingArtifact { kind, path, sha256: hash })
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> LaunchResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> LaunchResult<T> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
