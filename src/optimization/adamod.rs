use std::sync::atomic::Ordering;

use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};

use super::{
    UpdateRule,
    rule::{
        RuleState, StepContext, bias_corrections, check, check_beta, decay_moments, dense_only,
    },
};
use crate::{error::Result, parameters::Gradient};

/// AdaMod: Adam with a momental cap on the per-element learning rate.
///
/// An exponential moving average of the adaptive step sizes bounds each new
/// step size from above, damping the large steps Adam takes early in training.
///
/// The step counter is shared by every parameter of the optimizer, each call to
/// `update` advances it once.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaMod {
    pub beta1: f32,
    pub beta2: f32,
    /// Smoothing of the step size cap.
    pub beta3: f32,
    pub epsilon: f32,
    /// Decoupled decay, applied to the parameter directly.
    pub weight_decay: f32,
}

impl Default for AdaMod {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            beta3: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.,
        }
    }
}

/// The state AdaMod keeps for each parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaModState {
    pub exp_avg: ArrayD<f32>,
    pub exp_avg_sq: ArrayD<f32>,
    /// Running average of the step sizes, the cap.
    pub exp_avg_lr: ArrayD<f32>,
}

impl RuleState for AdaModState {
    fn buffers(&self) -> Vec<(&'static str, &ArrayD<f32>)> {
        vec![
            ("exp_avg", &self.exp_avg),
            ("exp_avg_sq", &self.exp_avg_sq),
            ("exp_avg_lr", &self.exp_avg_lr),
        ]
    }

    fn step(&self) -> Option<u64> {
        None
    }
}

impl UpdateRule for AdaMod {
    type State = AdaModState;

    const NAME: &'static str = "adamod";
    const SHARED_STEP: bool = true;

    fn validate(&self) -> Result<()> {
        check_beta("beta1", self.beta1)?;
        check_beta("beta2", self.beta2)?;
        check_beta("beta3", self.beta3)?;
        check(self.epsilon > 0., || {
            format!("epsilon must be positive, got {}", self.epsilon)
        })?;
        check(self.weight_decay >= 0., || {
            format!("weight_decay must be non-negative, got {}", self.weight_decay)
        })
    }

    fn init_state(&self, param: &ArrayD<f32>) -> Self::State {
        let zeros = ArrayD::zeros(param.raw_dim());

        AdaModState {
            exp_avg: zeros.clone(),
            exp_avg_sq: zeros.clone(),
            exp_avg_lr: zeros,
        }
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
            beta3: b3,
            epsilon: eps,
            weight_decay: wd,
        } = *self;

        let step = ctx.shared_step.fetch_add(1, Ordering::AcqRel) + 1;
        let lr = ctx.lr;

        let (bc1, bc2) = bias_corrections(b1, b2, step);
        let step_size = lr * bc2.sqrt() / bc1;

        Zip::from(param)
            .and(grad)
            .and(&mut state.exp_avg)
            .and(&mut state.exp_avg_sq)
            .and(&mut state.exp_avg_lr)
            .for_each(|p, &g, m, v, n| {
                decay_moments(m, v, g, b1, b2);
                let denom = v.sqrt() + eps;

                if wd != 0. {
                    *p -= wd * lr * *p;
                }

                let eta = step_size / denom;
                *n = b3 * *n + (1. - b3) * eta;
                *p -= eta.min(*n) * *m;
            });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use approx::assert_relative_eq;
    use ndarray::array;

    use super::*;
    use crate::{error::OptimErr, parameters::SparseGradient};

    fn ctx(lr: f32, shared_step: &AtomicU64) -> StepContext<'_> {
        StepContext {
            lr,
            base_lr: lr,
            shared_step,
        }
    }

    #[test]
    fn first_step_is_capped_by_average() {
        let rule = AdaMod::default();
        let shared = AtomicU64::new(0);
        let mut p = array![1f32].into_dyn();
        let mut state = rule.init_state(&p);
        let grad = Gradient::Dense(array![0.1f32].into_dyn());

        rule.update(&ctx(1e-3, &shared), &grad, &mut p, &mut state)
            .unwrap();

        // eta ~= 0.1, the cap after one step is (1 - beta3) * eta ~= 1e-4.
        let cap = state.exp_avg_lr[[0]];
        assert_relative_eq!(cap, 1e-4, max_relative = 1e-3);
        assert_relative_eq!(p[[0]], 1. - cap * 0.01, max_relative = 1e-6);
        assert_eq!(shared.load(Ordering::Acquire), 1);
    }

    #[test]
    fn shared_counter_advances_per_call() {
        let rule = AdaMod::default();
        let shared = AtomicU64::new(0);
        let grad = Gradient::Dense(array![0.1f32, 0.2].into_dyn());

        let mut a = array![1f32, 1.].into_dyn();
        let mut b = array![2f32, 2.].into_dyn();
        let mut a_state = rule.init_state(&a);
        let mut b_state = rule.init_state(&b);

        for _ in 0..3 {
            rule.update(&ctx(1e-3, &shared), &grad, &mut a, &mut a_state)
                .unwrap();
            rule.update(&ctx(1e-3, &shared), &grad, &mut b, &mut b_state)
                .unwrap();
        }

        assert_eq!(shared.load(Ordering::Acquire), 6);
        assert!(a_state.step().is_none());
    }

    #[test]
    fn decoupled_weight_decay() {
        let rule = AdaMod {
            weight_decay: 0.1,
            ..Default::default()
        };
        let shared = AtomicU64::new(0);
        let mut p = array![2f32].into_dyn();
        let mut state = rule.init_state(&p);
        let grad = Gradient::Dense(array![0f32].into_dyn());

        rule.update(&ctx(0.5, &shared), &grad, &mut p, &mut state)
            .unwrap();

        // Zero gradient: only the decay moves the parameter, 2 - 0.1 * 0.5 * 2.
        assert_relative_eq!(p[[0]], 1.9, max_relative = 1e-6);
        assert_eq!(state.exp_avg[[0]], 0.);
    }

    #[test]
    fn cap_never_exceeds_raw_step() {
        let rule = AdaMod::default();
        let shared = AtomicU64::new(0);
        let mut p = array![0f32, 0., 0.].into_dyn();
        let mut state = rule.init_state(&p);
        let lr = 1e-2;

        for i in 0..50 {
            let g = (i as f32 * 0.7).sin();
            let grad = Gradient::Dense(array![g, -2. * g, 0.5].into_dyn());
            let before = p.clone();

            rule.update(&ctx(lr, &shared), &grad, &mut p, &mut state)
                .unwrap();

            let step = shared.load(Ordering::Acquire);
            let (bc1, bc2) = bias_corrections(rule.beta1, rule.beta2, step);
            let step_size = lr * bc2.sqrt() / bc1;

            Zip::from(&before)
                .and(&p)
                .and(&state.exp_avg)
                .and(&state.exp_avg_sq)
                .for_each(|&b, &p, &m, &v| {
                    let raw = step_size / (v.sqrt() + rule.epsilon);
                    let moved = (b - p).abs();
                    assert!(moved <= raw * m.abs() * (1. + 1e-4) + 1e-12);
                });
        }
    }

    #[test]
    fn steady_gradient_steps_converge_to_cap() {
        let rule = AdaMod::default();
        let shared = AtomicU64::new(0);
        let grad = Gradient::Dense(array![0.5f32].into_dyn());
        let lr = 1e-3;

        let mut state = rule.init_state(&array![0f32].into_dyn());
        let mut applied = Vec::new();

        for _ in 0..20_000 {
            // Starting from zero every time, so the move is exactly the step.
            let mut p = array![0f32].into_dyn();
            rule.update(&ctx(lr, &shared), &grad, &mut p, &mut state)
                .unwrap();
            applied.push(-p[[0]] / state.exp_avg[[0]]);
        }

        // A constant gradient leaves no variance: the raw step size settles
        // at lr / |g| and the cap catches up with it.
        let cap = state.exp_avg_lr[[0]];
        let last = applied[applied.len() - 1];
        assert_relative_eq!(cap, lr / 0.5, max_relative = 1e-3);
        assert_relative_eq!(last, cap, max_relative = 1e-3);

        // Early on the cap is far below the raw step size and is what gets applied.
        assert!(applied[99] < 0.2 * last);
    }

    #[test]
    fn sparse_gradient_is_rejected() {
        let rule = AdaMod::default();
        let shared = AtomicU64::new(0);
        let mut p = array![[1f32], [2.]].into_dyn();
        let mut state = rule.init_state(&p);

        let values = array![[1f32]].into_dyn();
        let grad = Gradient::Sparse(SparseGradient::new(vec![1], values, vec![2, 1]).unwrap());

        let res = rule.update(&ctx(1e-3, &shared), &grad, &mut p, &mut state);

        assert!(matches!(res, Err(OptimErr::UnsupportedGradient { .. })));
        assert_eq!(shared.load(Ordering::Acquire), 0);
        assert_eq!(p, array![[1f32], [2.]].into_dyn());
    }
}
