//! `ember.toml` loading and layering.
//!
//! Configuration precedence:
//! 1. CLI arguments (handled by clap)
//! 2. `--config FILE`
//! 3. `ember.toml` in the workspace root
//! 4. Defaults
//!
//! Relative paths inside a file resolve against the workspace root, the same
//! as on the command line.

use anyhow::{Context, bail};
use ember_training::config::{PRECISION_OPTIONS, normalize_option_name};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "ember.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmberConfig {
    /// Run options, keyed by the same names the command line uses.
    #[serde(default)]
    pub run: BTreeMap<String, toml::Value>,

    #[serde(default)]
    pub launch: LaunchSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaunchSection {
    pub nproc_per_node: Option<usize>,
    pub master_addr: Option<String>,
    pub master_port: Option<u16>,
    pub trainer: Option<String>,
    pub trainer_args: Option<Vec<String>>,
    pub wandb_project: Option<String>,
}

impl EmberConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// `ember.toml` from the workspace root, or an empty config when there is none.
    pub fn discover(workspace_root: &Path) -> anyhow::Result<Self> {
        let path = Self::default_path(workspace_root);
        if path.is_file() {
            tracing::debug!(path = %path.display(), "loading workspace config");
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn default_path(workspace_root: &Path) -> PathBuf {
        workspace_root.join(CONFIG_FILE_NAME)
    }

    /// Layer `other` on top of `self`; values set in `other` win.
    ///
    /// `[run]` keys are compared in canonical form, and a layer that names any
    /// precision option replaces the whole precision group.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        let mut run = canonical_run(self.run);
        let overlay = canonical_run(other.run);
        if overlay.keys().any(|k| PRECISION_OPTIONS.contains(&k.as_str())) {
            run.retain(|k, _| !PRECISION_OPTIONS.contains(&k.as_str()));
        }
        run.extend(overlay);
        self.run = run;
        let launch = other.launch;
        self.launch = LaunchSection {
            nproc_per_node: launch.nproc_per_node.or(self.launch.nproc_per_node),
            master_addr: launch.master_addr.or(self.launch.master_addr),
            master_port: launch.master_port.or(self.launch.master_port),
            trainer: launch.trainer.or(self.launch.trainer),
            trainer_args: launch.trainer_args.or(self.launch.trainer_args),
            wandb_project: launch.wandb_project.or(self.launch.wandb_project),
        };
        self
    }

    /// The `[run]` table as raw `(option, value)` pairs for assembly.
    pub fn run_pairs(&self) -> anyhow::Result<Vec<(String, String)>> {
        self.run
            .iter()
            .map(|(name, value)| Ok((normalize_option_name(name), toml_scalar(name, value)?)))
            .collect()
    }
}

fn canonical_run(run: BTreeMap<String, toml::Value>) -> BTreeMap<String, toml::Value> {
    run.into_iter().map(|(name, value)| (normalize_option_name(&name), value)).collect()
}

fn toml_scalar(name: &str, value: &toml::Value) -> anyhow::Result<String> {
    Ok(match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        other => bail!("[run] option `{}` must be a string, number or boolean, got {}", name, other.type_str()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const WORKSPACE_TOML: &str = r#"
[run]
model_name_or_path = "tiiuae/Falcon3-7B-Base"
learning_rate = 2e-5
bf16 = true
per_device_train_batch_size = 4

[launch]
nproc_per_node = 4
trainer_args = ["finetune.py"]
"#;

    #[test]
    fn test_discover_without_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let cfg = EmberConfig::discover(temp.path()).unwrap();
        assert!(cfg.run.is_empty());
        assert!(cfg.launch.nproc_per_node.is_none());
    }

    #[test]
    fn test_discover_reads_run_and_launch_tables() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(CONFIG_FILE_NAME), WORKSPACE_TOML).unwrap();

        let cfg = EmberConfig::discover(temp.path()).unwrap();
        assert_eq!(cfg.launch.nproc_per_node, Some(4));

        let pairs = cfg.run_pairs().unwrap();
        assert!(pairs.contains(&("bf16".to_string(), "true".to_string())));
        assert!(pairs.contains(&("per_device_train_batch_size".to_string(), "4".to_string())));
        let lr = pairs.iter().find(|(k, _)| k == "learning_rate").unwrap();
        assert!((lr.1.parse::<f64>().unwrap() - 2e-5).abs() < 1e-12);
    }

    #[test]
    fn test_merge_prefers_later_layer() {
        let base: EmberConfig = toml::from_str(WORKSPACE_TOML).unwrap();
        let overlay: EmberConfig = toml::from_str(
            r#"
[run]
per_device_train_batch_size = 8
[launch]
master_port = 29600
"#,
        )
        .unwrap();

        let merged = base.merge(overlay);
        assert_eq!(merged.run["per_device_train_batch_size"].as_integer(), Some(8));
        assert_eq!(merged.run["bf16"].as_bool(), Some(true));
        assert_eq!(merged.launch.nproc_per_node, Some(4));
        assert_eq!(merged.launch.master_port, Some(29600));
        assert_eq!(merged.launch.trainer_args, Some(vec!["finetune.py".to_string()]));
    }

    #[test]
    fn test_merge_matches_keys_across_spellings() {
        let base: EmberConfig = toml::from_str("[run]\nper_device_train_batch_size = 4\n").unwrap();
        let overlay: EmberConfig = toml::from_str("[run]\nper-device-train-batch-size = 8\n").unwrap();

        let merged = base.merge(overlay);
        assert_eq!(merged.run.len(), 1);
        assert_eq!(merged.run["per_device_train_batch_size"].as_integer(), Some(8));

        let mut pairs = merged.run_pairs().unwrap();
        pairs.extend(
            [("model_name_or_path", "m"), ("data_path", "d.jsonl"), ("output_dir", "out")]
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        let run = ember_training::assemble(pairs, Path::new("/ws")).unwrap();
        assert_eq!(run.per_device_train_batch_size, 8);
    }

    #[test]
    fn test_merge_replaces_precision_group() {
        let base: EmberConfig = toml::from_str("[run]\nbf16 = true\nseed = 7\n").unwrap();
        let overlay: EmberConfig = toml::from_str("[run]\nprecision = \"fp16\"\n").unwrap();

        let merged = base.merge(overlay);
        assert!(!merged.run.contains_key("bf16"));
        assert_eq!(merged.run["precision"].as_str(), Some("fp16"));
        assert_eq!(merged.run["seed"].as_integer(), Some(7));
    }

    #[test]
    fn test_unknown_table_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.toml");
        std::fs::write(&path, "[trainer]\nname = \"x\"\n").unwrap();
        assert!(EmberConfig::load(&path).is_err());
    }

    #[test]
    fn test_nested_run_value_is_rejected() {
        let cfg: EmberConfig = toml::from_str("[run]\nseed = [1, 2]\n").unwrap();
        let err = cfg.run_pairs().unwrap_err();
        assert!(err.to_string().contains("seed"));
    }
}
