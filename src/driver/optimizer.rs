use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, trace};
use ndarray::{ArrayD, Zip};
use rayon::prelude::*;

use super::{Clipping, OptimizerConfig, OptimizerState, StepCount, TrainingOptions};
use crate::{
    error::{OptimErr, Result},
    optimization::{RuleState, StepContext, UpdateRule},
    parameters::{Gradient, Parameter},
    specs::RuleSpec,
    storage::{StateSlot, StateStore},
};

#[derive(Debug)]
struct Built<S> {
    base_lr: f32,
    store: StateStore<S>,
    /// Summed gradients of the pending accumulation window, one per slot.
    accumulators: Vec<ArrayD<f32>>,
    /// Moving averages of the parameters, one per slot.
    averages: Vec<ArrayD<f32>>,
}

impl<S> Built<S> {
    /// Adds every gradient to its accumulator. On an update step the gradients
    /// are replaced by the mean of the window and the accumulators are reset.
    fn accumulate(
        &mut self,
        grads_and_params: &mut [(Gradient, &mut Parameter)],
        positions: &[usize],
        steps: u64,
        update: bool,
    ) {
        for ((grad, _), &pos) in grads_and_params.iter_mut().zip(positions) {
            let acc = &mut self.accumulators[pos];
            *acc += &*grad.to_dense();

            if update {
                *grad = Gradient::Dense(acc.mapv(|g| g / steps as f32));
                acc.fill(0.);
            }
        }
    }

    fn update_averages(
        &mut self,
        grads_and_params: &mut [(Gradient, &mut Parameter)],
        positions: &[usize],
        momentum: f32,
        overwrite: bool,
    ) {
        for ((_, param), &pos) in grads_and_params.iter_mut().zip(positions) {
            let average = &mut self.averages[pos];

            Zip::from(&mut *average)
                .and(param.value())
                .for_each(|a, &p| *a = momentum * *a + (1. - momentum) * p);

            if overwrite {
                param.value_mut().assign(&*average);
            }
        }
    }
}

/// Drives an `UpdateRule` over the trainable parameters of a model.
///
/// Owns the per-parameter state, the learning rate, the clipping and training
/// options and the step counters. The state is allocated by `build` and
/// updated through `update_step` or `apply_gradients`.
#[derive(Debug)]
pub struct Optimizer<R: UpdateRule> {
    rule: R,
    learning_rate: f32,
    clipping: Clipping,
    options: TrainingOptions,
    iterations: u64,
    shared_step: AtomicU64,
    built: Option<Built<R::State>>,
}

impl<R: UpdateRule> Optimizer<R> {
    /// Creates a new `Optimizer`.
    ///
    /// # Arguments
    /// * `rule` - The update rule and its hyperparameters.
    /// * `learning_rate` - The initial learning rate.
    ///
    /// # Returns
    /// A new unbuilt `Optimizer` or `InvalidConfig` if a hyperparameter is out of range.
    pub fn new(rule: R, learning_rate: f32) -> Result<Self> {
        rule.validate()?;

        if learning_rate.is_nan() || learning_rate <= 0. {
            return Err(OptimErr::InvalidConfig(format!(
                "learning_rate must be positive, got {learning_rate}"
            )));
        }

        Ok(Self {
            rule,
            learning_rate,
            clipping: Clipping::default(),
            options: TrainingOptions::default(),
            iterations: 0,
            shared_step: AtomicU64::new(0),
            built: None,
        })
    }

    /// Creates a new `Optimizer` from a deserialized `RuleSpec`.
    pub fn from_spec(spec: RuleSpec<R>) -> Result<Self> {
        Self::new(spec.rule, spec.learning_rate)?
            .with_clipping(spec.clipping)?
            .with_options(spec.options)
    }

    /// Replaces the clipping options.
    ///
    /// # Returns
    /// The optimizer or `InvalidConfig` if the options are inconsistent.
    pub fn with_clipping(mut self, clipping: Clipping) -> Result<Self> {
        clipping.validate()?;
        self.clipping = clipping;
        Ok(self)
    }

    pub fn clip_value(self, clipvalue: f32) -> Result<Self> {
        let clipping = Clipping {
            clipvalue: Some(clipvalue),
            ..self.clipping
        };
        self.with_clipping(clipping)
    }

    pub fn clip_norm(self, clipnorm: f32) -> Result<Self> {
        let clipping = Clipping {
            clipnorm: Some(clipnorm),
            ..self.clipping
        };
        self.with_clipping(clipping)
    }

    pub fn global_clip_norm(self, global_clipnorm: f32) -> Result<Self> {
        let clipping = Clipping {
            global_clipnorm: Some(global_clipnorm),
            ..self.clipping
        };
        self.with_clipping(clipping)
    }

    /// Replaces the training options. They size buffers allocated by `build`,
    /// so they can't change afterwards.
    ///
    /// # Returns
    /// The optimizer or `InvalidConfig` if an option is out of range or the
    /// optimizer is already built.
    pub fn with_options(mut self, options: TrainingOptions) -> Result<Self> {
        options.validate()?;

        if self.built.is_some() && options != self.options {
            return Err(OptimErr::InvalidConfig(
                "training options can't change once the optimizer is built".to_string(),
            ));
        }

        self.options = options;
        Ok(self)
    }

    pub fn name(&self) -> &'static str {
        R::NAME
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Sets the learning rate used by the following calls to `apply_gradients`.
    pub fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    /// Returns the amount of successful `apply_gradients` calls.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn is_built(&self) -> bool {
        self.built.is_some()
    }

    /// Allocates the state of every trainable parameter.
    ///
    /// Calling it again once built does nothing.
    ///
    /// # Arguments
    /// * `params` - The trainable parameters of the model.
    ///
    /// # Returns
    /// `DuplicateParameter` if a parameter is listed twice.
    pub fn build(&mut self, params: &[&Parameter]) -> Result<()> {
        if self.built.is_some() {
            debug!(optimizer = R::NAME; "optimizer already built, ignoring");
            return Ok(());
        }

        let rule = &self.rule;
        let store = StateStore::new(params.iter().copied(), |param| {
            rule.init_state(param.value())
        })?;

        let zeros = |enabled: bool| -> Vec<ArrayD<f32>> {
            if !enabled {
                return Vec::new();
            }

            params
                .iter()
                .map(|param| ArrayD::zeros(param.value().raw_dim()))
                .collect()
        };

        debug!(optimizer = R::NAME, params = store.len(); "built optimizer");

        self.built = Some(Built {
            base_lr: self.learning_rate,
            store,
            accumulators: zeros(self.options.gradient_accumulation_steps.is_some()),
            averages: zeros(self.options.use_ema),
        });

        Ok(())
    }

    /// Looks up the slot of `param` and checks `grad` against it, without
    /// changing anything.
    ///
    /// # Returns
    /// The build-time position of the parameter and its slot.
    fn check_pair<'b>(
        &self,
        built: &'b Built<R::State>,
        grad: &Gradient,
        param: &Parameter,
        check_rule: bool,
    ) -> Result<(usize, &'b StateSlot<R::State>)> {
        let (pos, slot) = built.store.locate(param.id())?;

        slot.check_shape("parameter", param.shape())?;
        slot.check_shape("gradient", grad.shape())?;

        if check_rule {
            self.rule.accepts(grad)?;
        }

        Ok((pos, slot))
    }

    /// Applies a single gradient to its parameter.
    ///
    /// Distinct parameters can be updated concurrently from different threads,
    /// updates to the same parameter are serialized.
    ///
    /// # Arguments
    /// * `grad` - The gradient of `param`.
    /// * `param` - A parameter given to `build`.
    /// * `learning_rate` - The learning rate for this step.
    ///
    /// # Returns
    /// An error if the optimizer wasn't built, the parameter is unknown, the
    /// shapes don't match or the rule rejects the gradient.
    pub fn update_step(
        &self,
        grad: &Gradient,
        param: &mut Parameter,
        learning_rate: f32,
    ) -> Result<()> {
        let built = self.built.as_ref().ok_or(OptimErr::NotBuilt)?;
        let (_, slot) = self.check_pair(built, grad, param, true)?;

        let ctx = StepContext {
            lr: learning_rate,
            base_lr: built.base_lr,
            shared_step: &self.shared_step,
        };

        let mut state = slot.lock();
        trace!(optimizer = R::NAME, param = slot.name(); "updating parameter");

        self.rule.update(&ctx, grad, param.value_mut(), &mut state)
    }

    /// Runs a whole training step: unscales and clips the gradients, then
    /// updates every parameter with the current learning rate.
    ///
    /// Parameters are updated in parallel, unless the rule shares its step
    /// counter, in which case they're updated in list order. With gradient
    /// accumulation only every n-th call updates, with the mean gradient of
    /// the window. The moving averages follow every call.
    ///
    /// # Arguments
    /// * `grads_and_params` - Every gradient paired with its parameter.
    ///
    /// # Returns
    /// An error if any pair is rejected, in which case nothing changes.
    pub fn apply_gradients(
        &mut self,
        grads_and_params: &mut [(Gradient, &mut Parameter)],
    ) -> Result<()> {
        let built = self.built.as_ref().ok_or(OptimErr::NotBuilt)?;

        // Accumulated gradients are densified, so the rule only sees them once
        // the window is complete.
        let check_rule = self.options.gradient_accumulation_steps.is_none();
        let positions = grads_and_params
            .iter()
            .map(|(grad, param)| {
                self.check_pair(built, grad, param, check_rule)
                    .map(|(pos, _)| pos)
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some(scale) = self.options.loss_scale_factor {
            for (grad, _) in grads_and_params.iter_mut() {
                grad.values_mut().mapv_inplace(|g| g / scale);
            }
        }

        let update = self.options.updates_at(self.iterations);

        if let Some(steps) = self.options.gradient_accumulation_steps {
            let built = self.built.as_mut().ok_or(OptimErr::NotBuilt)?;
            built.accumulate(grads_and_params, &positions, steps, update);
        }

        if update {
            self.clipping
                .clip(grads_and_params.iter_mut().map(|(grad, _)| grad));

            let lr = self.learning_rate;
            let this = &*self;

            if R::SHARED_STEP {
                grads_and_params
                    .iter_mut()
                    .try_for_each(|(grad, param)| this.update_step(grad, param, lr))?;
            } else {
                grads_and_params
                    .par_iter_mut()
                    .try_for_each(|(grad, param)| this.update_step(grad, param, lr))?;
            }
        }

        if self.options.use_ema {
            let momentum = self.options.momentum_at(self.iterations);
            let overwrite = self.options.overwrites_at(self.iterations);
            let built = self.built.as_mut().ok_or(OptimErr::NotBuilt)?;
            built.update_averages(grads_and_params, &positions, momentum, overwrite);
        }

        self.iterations += 1;
        trace!(
            optimizer = R::NAME,
            iterations = self.iterations,
            updated = update;
            "applied gradients"
        );

        Ok(())
    }

    /// Overwrites the parameters with their moving average, once training is
    /// done. Does nothing unless `use_ema` is set.
    ///
    /// # Returns
    /// `NotBuilt`, `UnknownParameter` or `ShapeMismatch`, in which case no
    /// parameter is overwritten.
    pub fn finalize_variable_values(&self, params: &mut [&mut Parameter]) -> Result<()> {
        if !self.options.use_ema {
            return Ok(());
        }

        let built = self.built.as_ref().ok_or(OptimErr::NotBuilt)?;
        let positions = params
            .iter()
            .map(|param| {
                let (pos, slot) = built.store.locate(param.id())?;
                slot.check_shape("parameter", param.shape())?;
                Ok(pos)
            })
            .collect::<Result<Vec<_>>>()?;

        for (param, pos) in params.iter_mut().zip(positions) {
            param.value_mut().assign(&built.averages[pos]);
        }

        debug!(optimizer = R::NAME, params = params.len(); "overwrote parameters with averages");

        Ok(())
    }

    fn step_count(&self) -> StepCount {
        if R::SHARED_STEP {
            return StepCount::Shared(self.shared_step.load(Ordering::Acquire));
        }

        let steps = self
            .built
            .iter()
            .flat_map(|built| built.store.iter())
            .map(|slot| slot.lock().step().unwrap_or_default())
            .collect();

        StepCount::PerParameter(steps)
    }

    /// Describes the optimizer: its hyperparameters and where training is at.
    pub fn get_config(&self) -> OptimizerConfig<R> {
        OptimizerConfig {
            name: R::NAME.to_string(),
            learning_rate: self.learning_rate,
            iterations: self.iterations,
            clipping: self.clipping,
            options: self.options,
            hyperparameters: self.rule.clone(),
            step: self.step_count(),
        }
    }

    /// Takes a snapshot of the optimizer's state.
    ///
    /// # Returns
    /// The snapshot or `NotBuilt`.
    pub fn state_dict(&self) -> Result<OptimizerState<R::State>> {
        let built = self.built.as_ref().ok_or(OptimErr::NotBuilt)?;

        Ok(OptimizerState {
            optimizer: R::NAME.to_string(),
            learning_rate: self.learning_rate,
            base_learning_rate: built.base_lr,
            iterations: self.iterations,
            shared_step: self.shared_step.load(Ordering::Acquire),
            slots: built.store.iter().map(|slot| slot.lock().clone()).collect(),
            accumulators: built.accumulators.clone(),
            averages: built.averages.clone(),
        })
    }

    /// Restores a snapshot taken by `state_dict`.
    ///
    /// The optimizer must already be built with parameters of the same shapes,
    /// in the same order, and with the same training options. Nothing is
    /// restored unless the whole snapshot is valid.
    ///
    /// # Returns
    /// `NotBuilt` or `IncompatibleState` describing the first mismatch.
    pub fn load_state_dict(&mut self, state: OptimizerState<R::State>) -> Result<()> {
        let built = self.built.as_mut().ok_or(OptimErr::NotBuilt)?;

        if state.optimizer != R::NAME {
            return Err(OptimErr::IncompatibleState(format!(
                "the state belongs to {}, not to {}",
                state.optimizer,
                R::NAME
            )));
        }

        if state.slots.len() != built.store.len() {
            return Err(OptimErr::IncompatibleState(format!(
                "the state has {} slots but the optimizer was built with {} parameters",
                state.slots.len(),
                built.store.len()
            )));
        }

        for (slot, saved) in built.store.iter().zip(&state.slots) {
            saved.check_shapes(slot.shape()).map_err(|err| match err {
                OptimErr::IncompatibleState(msg) => {
                    OptimErr::IncompatibleState(format!("{}: {msg}", slot.name()))
                }
                err => err,
            })?;

            self.rule.check_state(saved)?;
        }

        check_buffers("accumulators", &state.accumulators, &built.accumulators)?;
        check_buffers("averages", &state.averages, &built.averages)?;

        for (slot, saved) in built.store.iter().zip(state.slots) {
            *slot.lock() = saved;
        }

        built.base_lr = state.base_learning_rate;
        built.accumulators = state.accumulators;
        built.averages = state.averages;
        self.learning_rate = state.learning_rate;
        self.iterations = state.iterations;
        self.shared_step.store(state.shared_step, Ordering::Release);

        debug!(optimizer = R::NAME, iterations = self.iterations; "restored optimizer state");

        Ok(())
    }
}

/// Checks that saved per-parameter buffers line up with the ones kept by the
/// optimizer: as many, with the same shapes.
fn check_buffers(what: &str, saved: &[ArrayD<f32>], kept: &[ArrayD<f32>]) -> Result<()> {
    if saved.len() != kept.len() {
        return Err(OptimErr::IncompatibleState(format!(
            "the state has {} {what} but the optimizer keeps {}",
            saved.len(),
            kept.len()
        )));
    }

    for (i, (saved, kept)) in saved.iter().zip(kept).enumerate() {
        if saved.shape() != kept.shape() {
            return Err(OptimErr::IncompatibleState(format!(
                "{what}[{i}] has shape {:?}, expected {:?}",
                saved.shape(),
                kept.shape()
            )));
        }
    }

    Ok(())
}
