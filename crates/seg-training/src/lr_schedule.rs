//! Exponential learning rate decay driven by the global step.

use serde::{Deserialize, Serialize};
use seg_core::ExperimentConfig;

/// `base * decay^(step / decay_steps)`, with the exponent floored when
/// `staircase` is set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExponentialDecay {
    pub base_lr: f64,
    pub decay_factor: f64,
    pub decay_steps: u64,
    pub staircase: bool,
}

impl ExponentialDecay {
    pub fn new(base_lr: f64, decay_factor: f64, decay_steps: u64, staircase: bool) -> Self {
        Self {
            base_lr,
            decay_factor,
            decay_steps: decay_steps.max(1),
            staircase,
        }
    }

    /// Decays every `epochs_per_decay` epochs of `steps_per_epoch` steps.
    pub fn from_config(config: &ExperimentConfig, steps_per_epoch: usize) -> Self {
        let decay_steps = (steps_per_epoch * config.training.epochs_per_decay) as u64;
        Self::new(
            config.starting_learning_rate(),
            config.training.decay_factor,
            decay_steps,
            config.training.staircase,
        )
    }

    /// Learning rate at `global_step`
    pub fn learning_rate(&self, global_step: u64) -> f64 {
        let exponent = if self.staircase {
            (global_step / self.decay_steps) as f64
        } else {
            global_step as f64 / self.decay_steps as f64
        };
        self.base_lr * self.decay_factor.powf(exponent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staircase_values() {
        let schedule = ExponentialDecay::new(0.001, 0.85, 100, true);
        assert_eq!(schedule.learning_rate(0), 0.001);
        assert_eq!(schedule.learning_rate(99), 0.001);
        assert!((schedule.learning_rate(100) - 0.00085).abs() < 1e-12);
        assert!((schedule.learning_rate(250) - 0.001 * 0.85 * 0.85).abs() < 1e-12);
    }

    #[test]
    fn test_continuous_decay() {
        let schedule = ExponentialDecay::new(0.001, 0.85, 100, false);
        let lr = schedule.learning_rate(50);
        assert!((lr - 0.001 * 0.85f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_from_config() {
        let mut config = ExperimentConfig::default();
        let schedule = ExponentialDecay::from_config(&config, 20);
        assert_eq!(schedule.decay_steps, 200);
        assert_eq!(schedule.base_lr, 0.001);

        config.training.freeze = true;
        let schedule = ExponentialDecay::from_config(&config, 0);
        assert_eq!(schedule.decay_steps, 1);
        assert_eq!(schedule.base_lr, 0.0001);
    }
}
