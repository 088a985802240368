use std::{
    error::Error,
    fmt::{self, Display},
};

use crate::parameters::ParamId;

/// The result type used in the entire crate.
pub type Result<T> = std::result::Result<T, OptimErr>;

/// The optimizers' error type.
#[derive(Debug)]
pub enum OptimErr {
    /// A sparse gradient was handed to a rule that only accepts dense ones.
    UnsupportedGradient {
        optimizer: &'static str,
    },
    NotBuilt,
    UnknownParameter {
        id: ParamId,
    },
    DuplicateParameter {
        id: ParamId,
    },
    ShapeMismatch {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    InvalidConfig(String),
    IncompatibleState(String),
    Json(serde_json::Error),
}

impl Display for OptimErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimErr::UnsupportedGradient { optimizer } => write!(
                f,
                "{optimizer} does not support sparse gradients, densify the gradient first"
            ),
            OptimErr::NotBuilt => {
                f.write_str("the optimizer state was not built, call `build` before updating")
            }
            OptimErr::UnknownParameter { id } => {
                write!(f, "parameter {id} was not part of the optimizer's build list")
            }
            OptimErr::DuplicateParameter { id } => {
                write!(f, "parameter {id} appears more than once in the build list")
            }
            OptimErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "there's a shape mismatch in the {what}, got {got:?} and expected {expected:?}"
            ),
            OptimErr::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            OptimErr::IncompatibleState(msg) => write!(f, "incompatible optimizer state: {msg}"),
            OptimErr::Json(e) => write!(f, "json error: {e}"),
        }
    }
}

impl Error for OptimErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            OptimErr::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for OptimErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}
