use std::collections::HashMap;

use log::debug;

use super::StateSlot;
use crate::{
    error::{OptimErr, Result},
    parameters::{ParamId, Parameter},
};

/// The per-parameter auxiliary state of an optimizer.
///
/// Slots are allocated once, in build order, and looked up by the stable
/// identity of their parameter. The set of slots never changes afterwards.
#[derive(Debug)]
pub struct StateStore<S> {
    index: HashMap<ParamId, usize>,
    slots: Box<[StateSlot<S>]>,
}

impl<S> StateStore<S> {
    /// Creates a new `StateStore`.
    ///
    /// # Arguments
    /// * `params` - The trainable parameters, in the order the host will report them.
    /// * `init` - Produces the initial state for a parameter.
    ///
    /// # Returns
    /// A new `StateStore` or `DuplicateParameter` if an identity is repeated.
    pub fn new<'a, I, F>(params: I, mut init: F) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Parameter>,
        F: FnMut(&Parameter) -> S,
    {
        let mut index = HashMap::new();
        let mut slots = Vec::new();

        for param in params {
            let id = param.id();

            if index.insert(id, slots.len()).is_some() {
                return Err(OptimErr::DuplicateParameter { id });
            }

            let state = init(param);
            slots.push(StateSlot::new(param.name().to_string(), param.shape(), state));
        }

        debug!(slots = slots.len(); "allocated optimizer state");

        Ok(Self {
            index,
            slots: slots.into_boxed_slice(),
        })
    }

    /// Returns the amount of slots in the store.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Finds the slot owned by a parameter.
    ///
    /// # Arguments
    /// * `id` - The identity of the parameter.
    ///
    /// # Returns
    /// The build-time position of the parameter and its slot, or
    /// `UnknownParameter` if the parameter wasn't built.
    pub fn locate(&self, id: ParamId) -> Result<(usize, &StateSlot<S>)> {
        self.index
            .get(&id)
            .map(|&i| (i, &self.slots[i]))
            .ok_or(OptimErr::UnknownParameter { id })
    }

    /// Iterates the slots in build order.
    pub fn iter(&self) -> impl Iterator<Item = &StateSlot<S>> {
        self.slots.iter()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};

    use super::*;

    fn param(name: &str, shape: &[usize]) -> Parameter {
        Parameter::new(name, ArrayD::zeros(IxDyn(shape)))
    }

    #[test]
    fn slots_follow_build_order() {
        let a = param("a", &[2]);
        let b = param("b", &[3, 1]);
        let c = param("c", &[4]);

        let store = StateStore::new([&a, &b, &c], |p| p.value().len()).unwrap();

        assert_eq!(store.len(), 3);
        assert_eq!(store.locate(b.id()).unwrap().0, 1);

        let sizes: Vec<_> = store.iter().map(|slot| *slot.lock()).collect();
        assert_eq!(sizes, [2, 3, 4]);

        let names: Vec<_> = store.iter().map(|slot| slot.name().to_string()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn init_runs_once_per_parameter() {
        let a = param("a", &[2]);
        let b = param("b", &[2]);
        let mut calls = 0;

        let store = StateStore::new([&a, &b], |_| {
            calls += 1;
        })
        .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn unknown_parameter() {
        let a = param("a", &[2]);
        let stray = param("stray", &[2]);

        let store = StateStore::new([&a], |_| ()).unwrap();

        assert!(store.locate(a.id()).is_ok());
        assert!(matches!(
            store.locate(stray.id()),
            Err(OptimErr::UnknownParameter { id }) if id == stray.id()
        ));
    }

    #[test]
    fn duplicate_parameter() {
        let a = param("a", &[2]);
        let res = StateStore::new([&a, &a], |_| ());
        assert!(matches!(res, Err(OptimErr::DuplicateParameter { .. })));
    }

    #[test]
    fn empty_store() {
        let store = StateStore::<()>::new(std::iter::empty::<&Parameter>(), |_| ()).unwrap();
        assert!(store.is_empty());
    }
}
