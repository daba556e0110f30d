//! Command implementations for the Ember CLI.

pub mod checkpoints;
pub mod launch;
pub mod plan;
pub mod types;
pub mod worker;

pub use types::{LaunchArgs, PlanArgs, WorkerArgs};
