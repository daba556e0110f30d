//! Ember Training
//!
//! Launch primitives for distributed fine-tuning runs:
//! - Assembling an immutable run configuration (`RunConfig`, `LaunchConfig`)
//! - Checking the distributed-backend file against it (`BackendConfig`)
//! - Spawning and supervising one process per device (`Launcher`)
//! - Checkpoint layout and rotation (`OutputLayout`)
//! - A reference training procedure (`worker::run_worker`)

pub mod artifacts;
pub mod backend;
pub mod config;
pub mod dataset;
pub mod devices;
pub mod error;
pub mod launcher;
pub mod layout;
pub mod procedure;
pub mod progress;
pub mod scheduler;
pub mod worker;

pub use artifacts::{ArtifactKind, RunId, TrainerState, TrainingArtifact, TrainingManifest, TrainingMetrics};
pub use backend::BackendConfig;
pub use config::{assemble, assemble_layers, pairs_from_args, LaunchConfig, LrSchedulerKind, Precision, RunConfig, RunConfigBuilder};
pub use dataset::{DatasetSource, SftExample, SftRecord};
pub use devices::{DeviceProbe, FixedDeviceProbe, SystemDeviceProbe};
pub use error::{BackendConfigError, ConfigError, ConfigResult, LaunchError, LaunchResult};
pub use launcher::{LaunchReport, Launcher, Preflight, RankOutcome};
pub use layout::{CheckpointEntry, OutputLayout};
pub use procedure::{ExternalProcedure, ProcessSpec, ReferenceProcedure, TrainingProcedure};
pub use progress::{CollectingProgressSink, OutputStream, ProgressEvent, ProgressSink, StdoutProgressSink};
pub use scheduler::{LrSchedule, StepPlan};
pub use worker::{run_worker, WorkerContext, WorkerSummary};
