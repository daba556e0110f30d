use crate::error::LaunchResult;
use std::path::{Path, PathBuf};

const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// Filesystem layout of a run's output directory.
///
/// ```text
/// <output_dir>/checkpoint-<step>/{trainer_state,run_config,model}.json
/// <output_dir>/{trainer_state,run_config,model}.json   (final)
/// <output_dir>/training_manifest.json
/// ```
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

/// A checkpoint directory found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub step: u64,
    pub path: PathBuf,
}

impl OutputLayout {
    #[must_use]
    pub fn new(output_dir: &Path) -> Self {
        Self { root: output_dir.to_path_buf() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn checkpoint_dir(&self, step: u64) -> PathBuf {
        self.root.join(format!("{CHECKPOINT_PREFIX}{step}"))
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("training_manifest.json")
    }

    #[must_use]
    pub fn trainer_state_path(dir: &Path) -> PathBuf {
        dir.join("trainer_state.json")
    }

    #[must_use]
    pub fn run_config_path(dir: &Path) -> PathBuf {
        dir.join("run_config.json")
    }

    #[must_use]
    pub fn model_path(dir: &Path) -> PathBuf {
        dir.join("model.json")
    }

    pub fn ensure_root(&self) -> LaunchResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Checkpoints sorted by step, oldest first. A missing output directory has none.
    pub fn list_checkpoints(&self) -> LaunchResult<Vec<CheckpointEntry>> {
        let mut out = Vec::new();
        let dir = match std::fs::read_dir(&self.root) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };

        for entry in dir {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(step) = name
                .to_str()
                .and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX))
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            out.push(CheckpointEntry { step, path: entry.path() });
        }

        out.sort_by_key(|c| c.step);
        Ok(out)
    }

    pub fn latest_checkpoint(&self) -> LaunchResult<Option<CheckpointEntry>> {
        Ok(self.list_checkpoints()?.pop())
    }

    /// Delete the oldest checkpoints until at most `keep` remain.
    ///
    /// Returns the removed entries.
    pub fn rotate_checkpoints(&self, keep: usize) -> LaunchResult<Vec<CheckpointEntry>> {
        let checkpoints = self.list_checkpoints()?;
        if checkpoints.len() <= keep {
            return Ok(Vec::new());
        }

        let excess = checkpoints.len() - keep;
        let removed: Vec<_> = checkpoints.into_iter().take(excess).collect();
        for ckpt in &removed {
            tracing::debug!(step = ckpt.step, path = %ckpt.path.display(), "removing old checkpoint");
            std::fs::remove_dir_all(&ckpt.path)?;
        }
        Ok(removed)
    }
}
