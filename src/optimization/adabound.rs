use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};

use super::{
    UpdateRule,
    rule::{
        RuleState, StepContext, bias_corrections, check, check_beta, decay_moments, dense_only,
    },
};
use crate::{
    error::{OptimErr, Result},
    parameters::Gradient,
};

/// AdaBound: Adam whose per-element step size is clipped into a band that
/// tightens around `final_lr` as training goes on, so it behaves like Adam
/// early and like SGD late.
///
/// Update rule:
/// ```text
/// m_t = beta1 * m_{t-1} + (1 - beta1) * g
/// v_t = beta2 * v_{t-1} + (1 - beta2) * g^2
/// eta = clip(lr * sqrt(1 - beta2^t) / (1 - beta1^t) / (sqrt(v_t) + eps), lower(t), upper(t))
/// p = p - eta * m_t
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaBound {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    /// L2 penalty folded into the gradient.
    pub weight_decay: f32,
    /// The SGD learning rate the bounds converge to.
    pub final_lr: f32,
    /// How fast the bounds converge.
    pub gamma: f32,
    /// Whether to normalize by the running maximum of the second moment.
    pub amsbound: bool,
}

impl Default for AdaBound {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.,
            final_lr: 0.1,
            gamma: 1e-3,
            amsbound: false,
        }
    }
}

impl AdaBound {
    /// Computes the step size band at a given step.
    ///
    /// # Arguments
    /// * `final_lr` - The effective final learning rate, already rescaled by the schedule.
    /// * `step` - The step number, starting at 1.
    ///
    /// # Returns
    /// The `(lower, upper)` bounds.
    pub fn bounds(&self, final_lr: f32, step: u64) -> (f32, f32) {
        let t = self.gamma * step as f32;
        let lower = final_lr * (1. - 1. / (t + 1.));
        let upper = final_lr * (1. + 1. / t);
        (lower, upper)
    }
}

/// The state AdaBound keeps for each parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaBoundState {
    pub exp_avg: ArrayD<f32>,
    pub exp_avg_sq: ArrayD<f32>,
    pub max_exp_avg_sq: Option<ArrayD<f32>>,
    pub step: u64,
}

impl RuleState for AdaBoundState {
    fn buffers(&self) -> Vec<(&'static str, &ArrayD<f32>)> {
        let mut buffers = vec![("exp_avg", &self.exp_avg), ("exp_avg_sq", &self.exp_avg_sq)];
        buffers.extend(self.max_exp_avg_sq.iter().map(|max| ("max_exp_avg_sq", max)));
        buffers
    }

    fn step(&self) -> Option<u64> {
        Some(self.step)
    }
}

impl UpdateRule for AdaBound {
    type State = AdaBoundState;

    const NAME: &'static str = "adabound";

    fn validate(&self) -> Result<()> {
        check_beta("beta1", self.beta1)?;
        check_beta("beta2", self.beta2)?;
        check(self.epsilon > 0., || {
            format!("epsilon must be positive, got {}", self.epsilon)
        })?;
        check(self.weight_decay >= 0., || {
            format!("weight_decay must be non-negative, got {}", self.weight_decay)
        })?;
        check(self.final_lr > 0., || {
            format!("final_lr must be positive, got {}", self.final_lr)
        })?;
        check(self.gamma > 0., || {
            format!("gamma must be positive, got {}", self.gamma)
        })
    }

    fn init_state(&self, param: &ArrayD<f32>) -> Self::State {
        let zeros = ArrayD::zeros(param.raw_dim());

        AdaBoundState {
            exp_avg: zeros.clone(),
            exp_avg_sq: zeros.clone(),
            max_exp_avg_sq: self.amsbound.then_some(zeros),
            step: 0,
        }
    }

    fn check_state(&self, state: &Self::State) -> Result<()> {
        let saved = state.max_exp_avg_sq.is_some();

        if saved != self.amsbound {
            return Err(OptimErr::IncompatibleState(format!(
                "the state was saved with amsbound={saved}"
            )));
        }

        Ok(())
    }

    fn accepts(&self, grad: &Gradient) -> Result<()> {
        dense_only(Self::NAME, grad).map(|_| ())
    }

    fn update(
        &self,
        ctx: &StepContext<'_>,
        grad: &Gradient,
        param: &mut ArrayD<f32>,
        state: &mut Self::State,
    ) -> Result<()> {
        let grad = dense_only(Self::NAME, grad)?;

        let Self {
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            weight_decay: wd,
            ..
        } = *self;

        state.step += 1;

        let (bc1, bc2) = bias_corrections(b1, b2, state.step);
        let step_size = ctx.lr * bc2.sqrt() / bc1;

        // The schedule can't reach `final_lr` directly, so it's rescaled by how far
        // the learning rate moved from its value at build time.
        let final_lr = self.final_lr * ctx.lr / ctx.base_lr;
        let (lower, upper) = self.bounds(final_lr, state.step);

        let bounded = |denom: f32| (step_size / denom).max(lower).min(upper);
        let decayed = |g: f32, p: f32| if wd != 0. { g + wd * p } else { g };

        let AdaBoundState {
            exp_avg,
            exp_avg_sq,
            max_exp_avg_sq,
            ..
        } = state;

        match max_exp_avg_sq {
            Some(max_exp_avg_sq) => Zip::from(param)
                .and(grad)
                .and(exp_avg)
                .and(exp_avg_sq)
                .and(max_exp_avg_sq)
                .for_each(|p, &g, m, v, v_max| {
                    decay_moments(m, v, decayed(g, *p), b1, b2);
                    *v_max = v_max.max(*v);
                    *p -= bounded(v_max.sqrt() + eps) * *m;
                }),
            None => Zip::from(param)
                .and(grad)
                .and(exp_avg)
                .and(exp_avg_sq)
                .for_each(|p, &g, m, v| {
                    decay_moments(m, v, decayed(g, *p), b1, b2);
                    *p -= bounded(v.sqrt() + eps) * *m;
                }),
        }

        Ok(())
    }
}
