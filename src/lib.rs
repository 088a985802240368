//! Bounded adaptive optimizers: AdaBound, AdamP and AdaMod.
//!
//! Each algorithm is an `UpdateRule` that moves a parameter given its gradient.
//! An `Optimizer` drives a rule over the trainable parameters of a model, owning
//! their state, the learning rate and the step counters.

pub mod driver;
pub mod error;
pub mod optimization;
pub mod parameters;
pub mod specs;
pub mod storage;

pub use driver::{
    AnyOptimizer, Clipping, Optimizer, OptimizerConfig, OptimizerState, StepCount, TrainingOptions,
};
pub use error::{OptimErr, Result};
pub use optimization::{AdaBound, AdaMod, AdamP, UpdateRule};
pub use parameters::{Gradient, ParamId, Parameter, SparseGradient};
pub use specs::{OptimizerSpec, RuleSpec};
