mod adabound;
mod adamod;
mod adamp;
pub mod projection;
mod rule;

pub use adabound::{AdaBound, AdaBoundState};
pub use adamod::{AdaMod, AdaModState};
pub use adamp::{AdamP, AdamPState};
pub use rule::{RuleState, StepContext, UpdateRule, bias_corrections};
