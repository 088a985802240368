use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::{
    error::{OptimErr, Result},
    parameters::Gradient,
};

/// Gradient clipping applied by `apply_gradients` before any update.
///
/// At most one option can be set. For sparse gradients only the stored rows
/// are looked at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Clipping {
    /// Clamps every element into `[-clipvalue, clipvalue]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clipvalue: Option<f32>,
    /// Rescales each gradient so its L2 norm is at most `clipnorm`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clipnorm: Option<f32>,
    /// Rescales all gradients together so their joint L2 norm is at most `global_clipnorm`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_clipnorm: Option<f32>,
}

impl Clipping {
    /// Checks that every threshold is positive and that at most one option is set.
    pub fn validate(&self) -> Result<()> {
        let thresholds = [
            ("clipvalue", self.clipvalue),
            ("clipnorm", self.clipnorm),
            ("global_clipnorm", self.global_clipnorm),
        ];

        for (name, threshold) in thresholds {
            if let Some(t) = threshold
                && (t.is_nan() || t <= 0.)
            {
                return Err(OptimErr::InvalidConfig(format!(
                    "{name} must be positive, got {t}"
                )));
            }
        }

        if thresholds.iter().filter(|(_, t)| t.is_some()).count() > 1 {
            return Err(OptimErr::InvalidConfig(
                "only one of clipvalue, clipnorm and global_clipnorm can be set".to_string(),
            ));
        }

        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.clipvalue.is_some() || self.clipnorm.is_some() || self.global_clipnorm.is_some()
    }

    /// Clips the gradients in place with whichever option is set.
    ///
    /// # Arguments
    /// * `grads` - Every gradient of the training step.
    pub fn clip<'a, I>(&self, grads: I)
    where
        I: IntoIterator<Item = &'a mut Gradient>,
    {
        if !self.is_enabled() {
            return;
        }

        let mut values: Vec<_> = grads.into_iter().map(Gradient::values_mut).collect();

        if let Some(c) = self.clipnorm {
            for g in values.iter_mut() {
                let norm = l2_norm(g);
                rescale(g, norm, c);
            }
        } else if let Some(c) = self.global_clipnorm {
            let global = values
                .iter()
                .map(|g| g.iter().map(|x| x * x).sum::<f32>())
                .sum::<f32>()
                .sqrt();

            for g in values.iter_mut() {
                rescale(g, global, c);
            }
        } else if let Some(v) = self.clipvalue {
            for g in values.iter_mut() {
                g.mapv_inplace(|x| x.max(-v).min(v));
            }
        }
    }
}

fn l2_norm(g: &ArrayD<f32>) -> f32 {
    g.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scales `g` by `c / norm` if `norm` exceeds `c`.
fn rescale(g: &mut ArrayD<f32>, norm: f32, c: f32) {
    if norm > c {
        let scale = c / norm;
        g.mapv_inplace(|x| x * scale);
    }
}
