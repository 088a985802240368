mod any;
mod clipping;
mod config;
mod optimizer;
mod options;

pub use any::AnyOptimizer;
pub use clipping::Clipping;
pub use config::{OptimizerConfig, OptimizerState, StepCount};
pub use optimizer::Optimizer;
pub use options::TrainingOptions;
