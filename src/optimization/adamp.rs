use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};

use super::{
    UpdateRule, projection,
    rule::{RuleState, StepContext, bias_corrections, check, check_beta, decay_moments},
};
use crate::{error::Result, parameters::Gradient};

/// AdamP: Adam that keeps scale-invariant weights from growing their norm.
///
/// When the gradient of a multi-dimensional parameter is nearly orthogonal to
/// the parameter itself (what happens to weights followed by a normalization
/// layer), the radial component of the update is projected out and the weight
/// decay is scaled down by `wd_ratio`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamP {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    /// Decoupled decay, applied multiplicatively before the update.
    pub weight_decay: f32,
    /// Cosine threshold under which the gradient counts as orthogonal.
    pub delta: f32,
    /// Weight decay multiplier used when the update was projected.
    pub wd_ratio: f32,
    pub nesterov: bool,
}

impl Default for AdamP {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.,
            delta: 0.1,
            wd_ratio: 0.1,
            nesterov: false,
        }
    }
}

/// The state AdamP keeps for each parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamPState {
    pub exp_avg: ArrayD<f32>,
    pub exp_avg_sq: ArrayD<f32>,
    pub step: u64,
}

impl RuleState for AdamPState {
    fn buffers(&self) -> Vec<(&'static str, &ArrayD<f32>)> {
        vec![("exp_avg", &self.exp_avg), ("exp_avg_sq", &self.exp_avg_sq)]
    }

    fn step(&self) -> Option<u64> {
        Some(self.step)
    }
}

impl UpdateRule for AdamP {
    type State = AdamPState;

    const NAME: &'static str = "adamp";

    fn validate(&self) -> Result<()> {
        check_beta("beta1", self.beta1)?;
        check_beta("beta2", self.beta2)?;
        check(self.epsilon > 0., || {
            format!("epsilon must be positive, got {}", self.epsilon)
        })?;
        check(self.weight_decay >= 0., || {
            format!("weight_decay must be non-negative, got {}", self.weight_decay)
        })?;
        check(self.delta > 0., || {
            format!("delta must be positive, got {}", self.delta)
        })?;
        check(self.wd_ratio >= 0., || {
            format!("wd_ratio must be non-negative, got {}", self.wd_ratio)
        })
    }

    fn init_state(&self, param: &ArrayD<f32>) -> Self::State {
        let zeros = ArrayD::zeros(param.raw_dim());

        AdamPState {
            exp_avg: zeros.clone(),
            exp_avg_sq: zeros,
            step: 0,
        }
    }

    fn update(
        &self,
        ctx: &StepContext<'_>,
        grad: &Gradient,
        param: &mut ArrayD<f32>,
        state: &mut Self::State,
    ) -> Result<()> {
        let grad = grad.to_dense();
        let grad: &ArrayD<f32> = &grad;

        let Self {
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            weight_decay: wd,
            nesterov,
            ..
        } = *self;

        state.step += 1;

        let (bc1, bc2) = bias_corrections(b1, b2, state.step);
        let bc2_sqrt = bc2.sqrt();

        Zip::from(&mut state.exp_avg)
            .and(&mut state.exp_avg_sq)
            .and(grad)
            .for_each(|m, v, &g| decay_moments(m, v, g, b1, b2));

        let mut perturb = Zip::from(&state.exp_avg)
            .and(&state.exp_avg_sq)
            .and(grad)
            .map_collect(|&m, &v, &g| {
                let denom = v.sqrt() / bc2_sqrt + eps;
                if nesterov {
                    (b1 * m + (1. - b1) * g) / denom
                } else {
                    m / denom
                }
            });

        let wd_ratio = if param.ndim() > 1 {
            projection::project(
                param.view(),
                grad.view(),
                &mut perturb,
                self.delta,
                self.wd_ratio,
                eps,
            )?
        } else {
            1.
        };

        if wd > 0. {
            *param *= 1. - ctx.lr * wd * wd_ratio;
        }

        param.scaled_add(-ctx.lr / bc1, &perturb);

        Ok(())
    }
}
