//! Learning-rate schedules and step accounting.

use crate::config::{LrSchedulerKind, POLYNOMIAL_END_LR, RunConfig};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// How many optimizer updates a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPlan {
    pub samples_per_rank: u64,
    pub batches_per_epoch: u64,
    pub steps_per_epoch: u64,
    pub total_steps: u64,
    pub warmup_steps: u64,
}

impl StepPlan {
    /// Data-parallel step math: every rank sees a ceil-divided shard of the
    /// dataset, and one update happens per `gradient_accumulation_steps` batches
    /// (at least one per epoch).
    #[must_use]
    pub fn compute(config: &RunConfig, num_samples: u64, world_size: usize) -> Self {
        let world = (world_size as u64).max(1);
        let samples_per_rank = num_samples.div_ceil(world);
        let batches_per_epoch = samples_per_rank.div_ceil(u64::from(config.per_device_train_batch_size));
        let steps_per_epoch = (batches_per_epoch / u64::from(config.gradient_accumulation_steps)).max(1);
        let total_steps = steps_per_epoch * u64::from(config.num_train_epochs);
        let warmup_steps = (total_steps as f64 * config.warmup_ratio).ceil() as u64;
        Self { samples_per_rank, batches_per_epoch, steps_per_epoch, total_steps, warmup_steps }
    }

    /// Fractional epoch reached after `step` updates.
    #[must_use]
    pub fn epoch_at(&self, step: u64) -> f64 {
        step as f64 / self.steps_per_epoch as f64
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LrSchedule {
    kind: LrSchedulerKind,
    base_lr: f64,
    warmup_steps: u64,
    total_steps: u64,
}

impl LrSchedule {
    #[must_use]
    pub fn new(kind: LrSchedulerKind, base_lr: f64, warmup_steps: u64, total_steps: u64) -> Self {
        Self { kind, base_lr, warmup_steps, total_steps }
    }

    #[must_use]
    pub fn for_run(config: &RunConfig, plan: &StepPlan) -> Self {
        Self::new(config.lr_scheduler_type, config.learning_rate, plan.warmup_steps, plan.total_steps)
    }

    /// Learning rate used for the update at `step` (0-based).
    #[must_use]
    pub fn lr_at(&self, step: u64) -> f64 {
        self.base_lr * self.multiplier(step)
    }

    fn multiplier(&self, step: u64) -> f64 {
        let s = step as f64;
        let warmup = self.warmup_steps as f64;
        let total = self.total_steps as f64;

        if self.kind == LrSchedulerKind::Constant {
            return 1.0;
        }
        if step < self.warmup_steps {
            return s / warmup.max(1.0);
        }

        let decay_span = (total - warmup).max(1.0);
        match self.kind {
            LrSchedulerKind::Constant | LrSchedulerKind::ConstantWithWarmup => 1.0,
            LrSchedulerKind::Linear => ((total - s) / decay_span).max(0.0),
            LrSchedulerKind::Cosine => {
                let progress = (s - warmup) / decay_span;
                (0.5 * (1.0 + (PI * progress).cos())).max(0.0)
            }
            LrSchedulerKind::Polynomial => {
                if step >= self.total_steps {
                    return POLYNOMIAL_END_LR / self.base_lr;
                }
                let remaining = 1.0 - (s - warmup) / decay_span;
                let lr = (self.base_lr - POLYNOMIAL_END_LR) * remaining + POLYNOMIAL_END_LR;
                lr / self.base_lr
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::assemble;
    use std::path::Path;

    fn run(extra: &[(&str, &str)]) -> RunConfig {
        let mut pairs = vec![("model_name_or_path", "m"), ("data_path", "d"), ("output_dir", "/o")];
        pairs.extend_from_slice(extra);
        assemble(pairs, Path::new("/")).unwrap()
    }

    #[test]
    fn test_step_plan_matches_data_parallel_math() {
        let cfg = run(&[
            ("num_train_epochs", "2"),
            ("per_device_train_batch_size", "4"),
            ("gradient_accumulation_steps", "4"),
            ("warmup_ratio", "0.5"),
        ]);
        // 1000 samples over 4 ranks: 250 each, 63 batches, 15 updates per epoch.
        let plan = StepPlan::compute(&cfg, 1000, 4);
        assert_eq!(plan.samples_per_rank, 250);
        assert_eq!(plan.batches_per_epoch, 63);
        assert_eq!(plan.steps_per_epoch, 15);
        assert_eq!(plan.total_steps, 30);
        assert_eq!(plan.warmup_steps, 15);
        assert!((plan.epoch_at(15) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_tiny_dataset_still_takes_one_step_per_epoch() {
        let cfg = run(&[("num_train_epochs", "2"), ("gradient_accumulation_steps", "16")]);
        let plan = StepPlan::compute(&cfg, 3, 4);
        assert_eq!(plan.steps_per_epoch, 1);
        assert_eq!(plan.total_steps, 2);
    }

    #[test]
    fn test_linear_warmup_then_decay() {
        let s = LrSchedule::new(LrSchedulerKind::Linear, 1e-4, 10, 110);
        assert_eq!(s.lr_at(0), 0.0);
        assert!((s.lr_at(5) - 5e-5).abs() < 1e-12);
        assert!((s.lr_at(10) - 1e-4).abs() < 1e-12);
        assert!((s.lr_at(60) - 5e-5).abs() < 1e-12);
        assert_eq!(s.lr_at(110), 0.0);
    }

    #[test]
    fn test_cosine_reaches_half_at_midpoint() {
        let s = LrSchedule::new(LrSchedulerKind::Cosine, 2e-5, 0, 100);
        assert!((s.lr_at(0) - 2e-5).abs() < 1e-15);
        assert!((s.lr_at(50) - 1e-5).abs() < 1e-12);
        assert!(s.lr_at(100) < 1e-15);
    }

    #[test]
    fn test_constant_variants() {
        let c = LrSchedule::new(LrSchedulerKind::Constant, 3e-4, 10, 100);
        assert_eq!(c.lr_at(0), 3e-4);
        let w = LrSchedule::new(LrSchedulerKind::ConstantWithWarmup, 3e-4, 10, 100);
        assert!(w.lr_at(5) < 3e-4);
        assert_eq!(w.lr_at(90), 3e-4);
    }

    #[test]
    fn test_polynomial_ends_at_floor() {
        let p = LrSchedule::new(LrSchedulerKind::Polynomial, 1e-4, 0, 10);
        assert!((p.lr_at(10) - POLYNOMIAL_END_LR).abs() < 1e-15);
        assert!(p.lr_at(5) < 1e-4 && p.lr_at(5) > POLYNOMIAL_END_LR);
    }
}
