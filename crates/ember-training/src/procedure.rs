//! How a rank's process is started.

use crate::config::LaunchConfig;
use std::path::PathBuf;

/// Workspace root handed to the reference worker.
pub const WORKSPACE_ENV: &str = "EMBER_WORKSPACE";
pub const WANDB_PROJECT_ENV: &str = "WANDB_PROJECT";

/// Everything needed to spawn one rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
}

/// Turns the launch configuration into a per-rank command line.
///
/// Implementations must give every rank the same run configuration; only the
/// rank differs.
pub trait TrainingProcedure: Send + Sync {
    fn id(&self) -> &str;

    fn process_spec(&self, launch: &LaunchConfig, rank: usize) -> ProcessSpec;
}

/// `torch.distributed`-style environment for one rank on a single node.
#[must_use]
pub fn distributed_env(launch: &LaunchConfig, rank: usize) -> Vec<(String, String)> {
    let world = launch.nproc_per_node.to_string();
    let mut env = vec![
        ("RANK".to_string(), rank.to_string()),
        ("LOCAL_RANK".to_string(), rank.to_string()),
        ("WORLD_SIZE".to_string(), world.clone()),
        ("LOCAL_WORLD_SIZE".to_string(), world),
        ("MASTER_ADDR".to_string(), launch.master_addr.clone()),
        ("MASTER_PORT".to_string(), launch.master_port.to_string()),
    ];
    if let Some(ref project) = launch.wandb_project {
        env.push((WANDB_PROJECT_ENV.to_string(), project.clone()));
    }
    env
}

/// The run configuration as `--name value` arguments.
#[must_use]
pub fn render_flags(launch: &LaunchConfig) -> Vec<String> {
    launch
        .run
        .to_pairs()
        .into_iter()
        .flat_map(|(name, value)| [format!("--{name}"), value])
        .collect()
}

/// An arbitrary program, e.g. `python finetune.py`, receiving Hugging Face style flags.
#[derive(Debug, Clone)]
pub struct ExternalProcedure {
    program: PathBuf,
    args: Vec<String>,
}

impl ExternalProcedure {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }
}

impl TrainingProcedure for ExternalProcedure {
    fn id(&self) -> &str {
        "external"
    }

    fn process_spec(&self, launch: &LaunchConfig, rank: usize) -> ProcessSpec {
        let mut args = self.args.clone();
        args.push(format!("--local_rank={rank}"));
        args.extend(render_flags(launch));
        ProcessSpec {
            program: self.program.clone(),
            args,
            env: distributed_env(launch, rank),
            cwd: launch.workspace_root.clone(),
        }
    }
}

/// The bundled reference trainer (`ember-cli worker`).
#[derive(Debug, Clone)]
pub struct ReferenceProcedure {
    exe: PathBuf,
}

impl ReferenceProcedure {
    #[must_use]
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }
}

impl TrainingProcedure for ReferenceProcedure {
    fn id(&self) -> &str {
        "reference"
    }

    fn process_spec(&self, launch: &LaunchConfig, rank: usize) -> ProcessSpec {
        let mut args = vec!["worker".to_string(), "--local-rank".to_string(), rank.to_string()];
        args.extend(render_flags(launch));
        let mut env = distributed_env(launch, rank);
        env.push((WORKSPACE_ENV.to_string(), launch.workspace_root.display().to_string()));
        ProcessSpec {
            program: self.exe.clone(),
            args,
            env,
            cwd: launch.workspace_root.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::assemble;
    use std::path::Path;

    fn launch_with(extra: &[(&str, &str)]) -> LaunchConfig {
        let mut pairs = vec![("model_name_or_path", "m"), ("data_path", "d.jsonl"), ("output_dir", "out"), ("bf16", "true")];
        pairs.extend_from_slice(extra);
        let run = assemble(pairs, Path::new("/ws")).unwrap();
        LaunchConfig::new(run, 4, PathBuf::from("/ws"))
    }

    fn launch() -> LaunchConfig {
        launch_with(&[])
    }

    fn flag_value<'a>(spec: &'a ProcessSpec, flag: &str) -> Option<&'a str> {
        let pos = spec.args.iter().position(|a| a == flag)?;
        spec.args.get(pos + 1).map(String::as_str)
    }

    fn env_value<'a>(spec: &'a ProcessSpec, key: &str) -> Option<&'a str> {
        spec.env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_external_spec_forwards_flags_and_rank() {
        let proc = ExternalProcedure::new("python", vec!["finetune.py".to_string()]);
        let spec = proc.process_spec(&launch(), 2);

        assert_eq!(spec.program, PathBuf::from("python"));
        assert_eq!(spec.args[0], "finetune.py");
        assert_eq!(spec.args[1], "--local_rank=2");
        let pos = spec.args.iter().position(|a| a == "--bf16").unwrap();
        assert_eq!(spec.args[pos + 1], "true");
        assert_eq!(env_value(&spec, "RANK"), Some("2"));
        assert_eq!(env_value(&spec, "WORLD_SIZE"), Some("4"));
        assert_eq!(env_value(&spec, "MASTER_PORT"), Some("29500"));
        assert_eq!(spec.cwd, PathBuf::from("/ws"));
    }

    #[test]
    fn test_ranks_differ_only_in_rank() {
        let proc = ReferenceProcedure::new("/bin/ember-cli");
        let cfg = launch();
        let a = proc.process_spec(&cfg, 0);
        let b = proc.process_spec(&cfg, 3);
        assert_eq!(a.args[3..], b.args[3..]);
        assert_eq!(b.args[..3], ["worker", "--local-rank", "3"]);
        assert_eq!(env_value(&b, WORKSPACE_ENV), Some("/ws"));
        assert_eq!(env_value(&b, "LOCAL_RANK"), Some("3"));
    }

    #[test]
    fn test_external_spec_forwards_script_options() {
        let proc = ExternalProcedure::new("python", vec!["finetune.py".to_string()]);
        let cfg = launch_with(&[("optim", "adamw_torch_fused"), ("cache_dir", "cache"), ("report_to", "wandb")]);
        let spec = proc.process_spec(&cfg, 0);

        assert_eq!(flag_value(&spec, "--optim"), Some("adamw_torch_fused"));
        assert_eq!(flag_value(&spec, "--cache_dir"), Some("/ws/cache"));
        assert_eq!(flag_value(&spec, "--report_to"), Some("wandb"));
        assert_eq!(env_value(&spec, WANDB_PROJECT_ENV), None);

        let defaults = proc.process_spec(&launch(), 0);
        assert_eq!(flag_value(&defaults, "--optim"), Some("adamw_torch"));
        assert_eq!(flag_value(&defaults, "--report_to"), None);
    }

    #[test]
    fn test_wandb_project_is_exported_to_every_rank() {
        let mut cfg = launch();
        cfg.wandb_project = Some("falcodecompile".to_string());
        for rank in 0..4 {
            let spec = ReferenceProcedure::new("/bin/ember-cli").process_spec(&cfg, rank);
            assert_eq!(env_value(&spec, WANDB_PROJECT_ENV), Some("falcodecompile"));
        }
    }
}
