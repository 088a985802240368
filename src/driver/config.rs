use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use super::{Clipping, TrainingOptions};

/// The step counters reported in an optimizer's config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepCount {
    /// One counter per parameter, in build order.
    PerParameter(Vec<u64>),
    /// A single counter shared by every parameter.
    Shared(u64),
}

/// A flat, serializable description of an optimizer: its name, learning rate,
/// clipping and training options, every hyperparameter of its rule and its
/// step counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig<R> {
    pub name: String,
    pub learning_rate: f32,
    pub iterations: u64,
    #[serde(flatten)]
    pub clipping: Clipping,
    #[serde(flatten)]
    pub options: TrainingOptions,
    #[serde(flatten)]
    pub hyperparameters: R,
    pub step: StepCount,
}

/// Everything needed to resume training with an optimizer.
///
/// Slots, accumulated gradients and moving averages are stored in the order
/// the parameters were given to `build`. The last two are empty unless the
/// matching option is on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState<S> {
    pub optimizer: String,
    pub learning_rate: f32,
    pub base_learning_rate: f32,
    pub iterations: u64,
    pub shared_step: u64,
    pub slots: Vec<S>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accumulators: Vec<ArrayD<f32>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub averages: Vec<ArrayD<f32>>,
}
