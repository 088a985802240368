use std::{fmt, sync::atomic::AtomicU64};

use ndarray::ArrayD;
use serde::{Serialize, de::DeserializeOwned};

use log::warn;

use crate::{
    error::{OptimErr, Result},
    parameters::Gradient,
};

/// The per-parameter state an `UpdateRule` keeps between steps.
pub trait RuleState: Clone + fmt::Debug + Send + Serialize + DeserializeOwned {
    /// Returns every buffer of the state, each one shaped like the parameter.
    fn buffers(&self) -> Vec<(&'static str, &ArrayD<f32>)>;

    /// Returns the step counter of this parameter, or `None` if the rule counts
    /// steps optimizer-wide.
    fn step(&self) -> Option<u64>;

    /// Checks that every buffer has the shape of the parameter.
    ///
    /// # Returns
    /// `IncompatibleState` naming the first buffer with another shape.
    fn check_shapes(&self, shape: &[usize]) -> Result<()> {
        match self.buffers().into_iter().find(|(_, buf)| buf.shape() != shape) {
            Some((name, buf)) => Err(OptimErr::IncompatibleState(format!(
                "{name} has shape {:?}, expected {shape:?}",
                buf.shape()
            ))),
            None => Ok(()),
        }
    }
}

/// Everything an `UpdateRule` needs to know about the current step, besides the
/// parameter and its state.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// The learning rate for this step, possibly modulated by a schedule.
    pub lr: f32,
    /// The learning rate the optimizer had when it was built.
    pub base_lr: f32,
    /// The optimizer-wide step counter, used by rules that don't count per parameter.
    pub shared_step: &'a AtomicU64,
}

/// Defines how a parameter moves given its gradient.
///
/// The transition of a parameter and its state from step `t` to `t+1` is the
/// only thing a rule is responsible for, lookups and locking are up to the caller.
pub trait UpdateRule: Clone + fmt::Debug + Send + Sync + Serialize {
    type State: RuleState;

    /// The name used in configs and saved states.
    const NAME: &'static str;

    /// Whether the rule advances the optimizer-wide step counter instead of a
    /// per-parameter one.
    const SHARED_STEP: bool = false;

    /// Checks the hyperparameters.
    ///
    /// # Returns
    /// `InvalidConfig` describing the first offending hyperparameter.
    fn validate(&self) -> Result<()>;

    /// Allocates the initial state for a parameter.
    fn init_state(&self, param: &ArrayD<f32>) -> Self::State;

    /// Checks that a restored state is one this rule could have produced.
    fn check_state(&self, _state: &Self::State) -> Result<()> {
        Ok(())
    }

    /// Checks whether the rule can take `grad`, without touching any state.
    fn accepts(&self, _grad: &Gradient) -> Result<()> {
        Ok(())
    }

    /// Updates `param` in place according to the rule.
    ///
    /// # Arguments
    /// * `ctx` - The learning rates and the shared step counter.
    /// * `grad` - The gradient, with the same shape as `param`.
    /// * `param` - The values to update.
    /// * `state` - This parameter's state.
    ///
    /// # Returns
    /// An error if the gradient isn't supported, in which case neither `param`
    /// nor `state` are modified.
    fn update(
        &self,
        ctx: &StepContext<'_>,
        grad: &Gradient,
        param: &mut ArrayD<f32>,
        state: &mut Self::State,
    ) -> Result<()>;
}

/// Computes the bias corrections `1 - beta1^step` and `1 - beta2^step`.
pub fn bias_corrections(beta1: f32, beta2: f32, step: u64) -> (f32, f32) {
    let t = step.min(i32::MAX as u64) as i32;
    (1. - beta1.powi(t), 1. - beta2.powi(t))
}

/// Decays a first and second moment running average with a new gradient element.
#[inline]
pub(crate) fn decay_moments(m: &mut f32, v: &mut f32, g: f32, beta1: f32, beta2: f32) {
    *m = beta1 * *m + (1. - beta1) * g;
    *v = beta2 * *v + (1. - beta2) * g * g;
}

/// Unwraps a dense gradient, rejecting sparse ones for rules that can't take them.
pub(crate) fn dense_only<'g>(
    optimizer: &'static str,
    grad: &'g Gradient,
) -> Result<&'g ArrayD<f32>> {
    match grad {
        Gradient::Dense(grad) => Ok(grad),
        Gradient::Sparse(_) => {
            warn!(optimizer = optimizer; "rejected sparse gradient");
            Err(OptimErr::UnsupportedGradient { optimizer })
        }
    }
}

pub(crate) fn check(ok: bool, msg: impl FnOnce() -> String) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(OptimErr::InvalidConfig(msg()))
    }
}

pub(crate) fn check_beta(name: &str, beta: f32) -> Result<()> {
    check((0. ..1.).contains(&beta), || {
        format!("{name} must be in [0, 1), got {beta}")
    })
}
