use std::{
    fmt::{self, Display},
    sync::atomic::{AtomicU64, Ordering},
};

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// The stable identity of a trainable parameter.
///
/// Optimizers key their per-parameter state by this id, so it never changes
/// during the lifetime of the `Parameter` it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamId(u64);

impl ParamId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A host-owned trainable array.
///
/// Optimizers write into its values in place but never reallocate it. It's not
/// `Clone` on purpose, two parameters sharing an id would share optimizer state.
#[derive(Debug)]
pub struct Parameter {
    id: ParamId,
    name: String,
    value: ArrayD<f32>,
}

impl Parameter {
    /// Creates a new `Parameter` with a fresh identity.
    ///
    /// # Arguments
    /// * `name` - A human readable name, used in logs and configs.
    /// * `value` - The initial values of the parameter.
    ///
    /// # Returns
    /// A new `Parameter` instance.
    pub fn new(name: impl Into<String>, value: ArrayD<f32>) -> Self {
        Self {
            id: ParamId::next(),
            name: name.into(),
            value,
        }
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    pub fn value(&self) -> &ArrayD<f32> {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut ArrayD<f32> {
        &mut self.value
    }
}

#[cfg(test)]
mod tests {
    use ndarray::IxDyn;

    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = Parameter::new("a", ArrayD::zeros(IxDyn(&[2])));
        let b = Parameter::new("b", ArrayD::zeros(IxDyn(&[2])));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn mutation_keeps_identity() {
        let mut p = Parameter::new("w", ArrayD::zeros(IxDyn(&[2, 2])));
        let id = p.id();

        p.value_mut().fill(3.);

        assert_eq!(p.id(), id);
        assert_eq!(p.shape(), &[2, 2]);
        assert!(p.value().iter().all(|&v| v == 3.));
    }
}
