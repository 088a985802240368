mod gradient;
mod parameter;

pub use gradient::{Gradient, SparseGradient};
pub use parameter::{ParamId, Parameter};
