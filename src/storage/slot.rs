use parking_lot::{Mutex, MutexGuard};

use crate::error::{OptimErr, Result};

/// The optimizer state of a single parameter.
///
/// Each slot has its own lock, so distinct parameters can be updated from
/// different threads while updates to the same parameter are serialized.
#[derive(Debug)]
pub struct StateSlot<S> {
    name: String,
    shape: Box<[usize]>,
    state: Mutex<S>,
}

impl<S> StateSlot<S> {
    /// Creates a new `StateSlot`.
    ///
    /// # Arguments
    /// * `name` - The name of the parameter owning this slot.
    /// * `shape` - The parameter's shape at build time.
    /// * `state` - The initial state.
    pub fn new(name: String, shape: &[usize], state: S) -> Self {
        Self {
            name,
            shape: shape.into(),
            state: Mutex::new(state),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Locks the slot, blocking until no other update holds it.
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock()
    }

    /// Checks that `shape` matches the shape this slot was built for.
    ///
    /// # Arguments
    /// * `what` - What's being checked, for the error message.
    /// * `shape` - The shape to compare.
    ///
    /// # Returns
    /// A `ShapeMismatch` error if the shapes differ.
    pub fn check_shape(&self, what: &'static str, shape: &[usize]) -> Result<()> {
        if *self.shape != *shape {
            return Err(OptimErr::ShapeMismatch {
                what,
                got: shape.to_vec(),
                expected: self.shape.to_vec(),
            });
        }

        Ok(())
    }
}
