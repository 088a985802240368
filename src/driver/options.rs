use serde::{Deserialize, Serialize};

use crate::error::{OptimErr, Result};

/// Options applied around the update rule by `apply_gradients`: gradient
/// unscaling, gradient accumulation and a moving average of the weights.
///
/// Every option is off by default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingOptions {
    /// Whether to keep an exponential moving average of every parameter.
    pub use_ema: bool,
    /// The momentum of the moving average.
    pub ema_momentum: f32,
    /// Every how many steps the parameters are overwritten with their average.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema_overwrite_frequency: Option<u64>,
    /// The factor the loss was multiplied by, gradients are divided by it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss_scale_factor: Option<f32>,
    /// How many calls to `apply_gradients` are averaged into a single update.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gradient_accumulation_steps: Option<u64>,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            use_ema: false,
            ema_momentum: 0.99,
            ema_overwrite_frequency: None,
            loss_scale_factor: None,
            gradient_accumulation_steps: None,
        }
    }
}

impl TrainingOptions {
    /// Checks that every option is in range.
    ///
    /// # Returns
    /// `InvalidConfig` describing the first offending option.
    pub fn validate(&self) -> Result<()> {
        if self.use_ema && !(0. ..=1.).contains(&self.ema_momentum) {
            return Err(OptimErr::InvalidConfig(format!(
                "ema_momentum must be in [0, 1], got {}",
                self.ema_momentum
            )));
        }

        if self.ema_overwrite_frequency == Some(0) {
            return Err(OptimErr::InvalidConfig(
                "ema_overwrite_frequency must be at least 1".to_string(),
            ));
        }

        if let Some(scale) = self.loss_scale_factor
            && !(scale.is_finite() && scale > 0.)
        {
            return Err(OptimErr::InvalidConfig(format!(
                "loss_scale_factor must be positive, got {scale}"
            )));
        }

        if let Some(steps) = self.gradient_accumulation_steps
            && steps < 2
        {
            return Err(OptimErr::InvalidConfig(format!(
                "gradient_accumulation_steps must be at least 2, got {steps}"
            )));
        }

        Ok(())
    }

    /// Returns the momentum of the moving average at a given iteration. The
    /// first iteration copies the parameters.
    pub(crate) fn momentum_at(&self, iterations: u64) -> f32 {
        if iterations == 0 {
            0.
        } else {
            self.ema_momentum
        }
    }

    /// Whether the parameters are overwritten with their average once the
    /// current iteration is done.
    pub(crate) fn overwrites_at(&self, iterations: u64) -> bool {
        self.ema_overwrite_frequency
            .is_some_and(|freq| (iterations + 1) % freq == 0)
    }

    /// Whether the current iteration updates the parameters, or only
    /// accumulates its gradients.
    pub(crate) fn updates_at(&self, iterations: u64) -> bool {
        self.gradient_accumulation_steps
            .is_none_or(|steps| (iterations + 1) % steps == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_by_default() {
        let options = TrainingOptions::default();

        assert!(options.validate().is_ok());
        assert!(!options.use_ema);
        assert!(!options.overwrites_at(0));
        assert!((0..5).all(|i| options.updates_at(i)));
    }

    #[test]
    fn accumulation_updates_every_n_iterations() {
        let options = TrainingOptions {
            gradient_accumulation_steps: Some(3),
            ..Default::default()
        };

        let updates: Vec<_> = (0..7).map(|i| options.updates_at(i)).collect();
        assert_eq!(updates, [false, false, true, false, false, true, false]);
    }

    #[test]
    fn average_starts_from_the_parameters() {
        let options = TrainingOptions {
            use_ema: true,
            ema_momentum: 0.9,
            ema_overwrite_frequency: Some(2),
            ..Default::default()
        };

        assert_eq!(options.momentum_at(0), 0.);
        assert_eq!(options.momentum_at(1), 0.9);
        assert!(!options.overwrites_at(0));
        assert!(options.overwrites_at(1));
        assert!(options.overwrites_at(3));
    }

    #[test]
    fn out_of_range_options() {
        let bad = [
            TrainingOptions {
                use_ema: true,
                ema_momentum: 1.5,
                ..Default::default()
            },
            TrainingOptions {
                ema_overwrite_frequency: Some(0),
                ..Default::default()
            },
            TrainingOptions {
                loss_scale_factor: Some(0.),
                ..Default::default()
            },
            TrainingOptions {
                loss_scale_factor: Some(f32::INFINITY),
                ..Default::default()
            },
            TrainingOptions {
                gradient_accumulation_steps: Some(1),
                ..Default::default()
            },
        ];

        for options in bad {
            assert!(matches!(options.validate(), Err(OptimErr::InvalidConfig(_))));
        }
    }

    #[test]
    fn unset_options_are_not_serialized() {
        let json = serde_json::to_value(TrainingOptions::default()).unwrap();
        assert_eq!(json, serde_json::json!({ "use_ema": false, "ema_momentum": 0.99f32 }));
    }
}
