use serde_json::Value;

use super::Optimizer;
use crate::{
    error::Result,
    optimization::{AdaBound, AdaMod, AdamP},
    parameters::{Gradient, Parameter},
    specs::OptimizerSpec,
};

/// Runs the same expression on whichever optimizer is inside an `AnyOptimizer`,
/// keeping the dispatch static.
///
/// # Arguments
/// * `any` - The `AnyOptimizer` to match on.
/// * `opt` - The name bound to the concrete optimizer.
/// * `body` - The expression to evaluate with `opt`.
macro_rules! with_optimizer {
    ($any:expr, $opt:ident => $body:expr) => {
        match $any {
            AnyOptimizer::AdaBound($opt) => $body,
            AnyOptimizer::AdamP($opt) => $body,
            AnyOptimizer::AdaMod($opt) => $body,
        }
    };
}

/// One of the available optimizers, picked at runtime from an `OptimizerSpec`.
#[derive(Debug)]
pub enum AnyOptimizer {
    AdaBound(Optimizer<AdaBound>),
    AdamP(Optimizer<AdamP>),
    AdaMod(Optimizer<AdaMod>),
}

impl AnyOptimizer {
    /// Builds the optimizer described by `spec`.
    ///
    /// # Returns
    /// A new unbuilt optimizer or `InvalidConfig` if the spec has out of range values.
    pub fn from_spec(spec: OptimizerSpec) -> Result<Self> {
        match spec {
            OptimizerSpec::AdaBound(spec) => Optimizer::from_spec(spec).map(Self::AdaBound),
            OptimizerSpec::AdamP(spec) => Optimizer::from_spec(spec).map(Self::AdamP),
            OptimizerSpec::AdaMod(spec) => Optimizer::from_spec(spec).map(Self::AdaMod),
        }
    }

    pub fn name(&self) -> &'static str {
        with_optimizer!(self, opt => opt.name())
    }

    pub fn build(&mut self, params: &[&Parameter]) -> Result<()> {
        with_optimizer!(self, opt => opt.build(params))
    }

    pub fn update_step(
        &self,
        grad: &Gradient,
        param: &mut Parameter,
        learning_rate: f32,
    ) -> Result<()> {
        with_optimizer!(self, opt => opt.update_step(grad, param, learning_rate))
    }

    pub fn apply_gradients(
        &mut self,
        grads_and_params: &mut [(Gradient, &mut Parameter)],
    ) -> Result<()> {
        with_optimizer!(self, opt => opt.apply_gradients(grads_and_params))
    }

    pub fn finalize_variable_values(&self, params: &mut [&mut Parameter]) -> Result<()> {
        with_optimizer!(self, opt => opt.finalize_variable_values(params))
    }

    pub fn learning_rate(&self) -> f32 {
        with_optimizer!(self, opt => opt.learning_rate())
    }

    pub fn set_learning_rate(&mut self, learning_rate: f32) {
        with_optimizer!(self, opt => opt.set_learning_rate(learning_rate))
    }

    pub fn iterations(&self) -> u64 {
        with_optimizer!(self, opt => opt.iterations())
    }

    /// Renders the optimizer's config as a flat JSON object.
    pub fn get_config(&self) -> Result<Value> {
        with_optimizer!(self, opt => Ok(serde_json::to_value(opt.get_config())?))
    }

    /// Renders the optimizer's state snapshot as JSON.
    pub fn state_dict(&self) -> Result<Value> {
        with_optimizer!(self, opt => Ok(serde_json::to_value(opt.state_dict()?)?))
    }

    /// Restores a snapshot rendered by `state_dict`.
    pub fn load_state_dict(&mut self, state: Value) -> Result<()> {
        with_optimizer!(self, opt => opt.load_state_dict(serde_json::from_value(state)?))
    }
}
