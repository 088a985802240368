use std::{env, fs};

use anyhow::{Context, Result};
use bounded_optim::{AnyOptimizer, Gradient, OptimizerSpec, Parameter};
use log::info;
use ndarray::{Array1, Array2, ArrayD, Ix2, IxDyn};
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};

const SAMPLES: usize = 256;
const FEATURES: usize = 4;
const STEPS: usize = 300;
const SEED: u64 = 42;

/// A noisy linear regression problem, `y = x . w + b + noise`.
struct Problem {
    x: Array2<f32>,
    y: Array1<f32>,
}

impl Problem {
    fn generate(seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0f32, 1.)?;
        let noise = Normal::new(0f32, 0.01)?;

        let x = Array2::from_shape_simple_fn((SAMPLES, FEATURES), || normal.sample(&mut rng));
        let w = Array1::from_shape_simple_fn(FEATURES, || normal.sample(&mut rng));
        let eps = Array1::from_shape_simple_fn(SAMPLES, || noise.sample(&mut rng));
        let y = x.dot(&w) + 0.5 + eps;

        Ok(Self { x, y })
    }

    /// Computes the mean squared error and its gradients with respect to the
    /// weights and the bias.
    fn loss_and_grads(
        &self,
        w: &Parameter,
        b: &Parameter,
    ) -> Result<(f32, ArrayD<f32>, ArrayD<f32>)> {
        let w = w.value().view().into_dimensionality::<Ix2>()?;
        let bias = b.value().sum();
        let n = SAMPLES as f32;

        let err = self.x.dot(&w.column(0)) + bias - &self.y;
        let loss = err.mapv(|e| e * e).sum() / n;

        let grad_w = self.x.t().dot(&err) * (2. / n);
        let grad_b = err.sum() * 2. / n;

        Ok((
            loss,
            grad_w.into_shape_with_order((FEATURES, 1))?.into_dyn(),
            ArrayD::from_elem(IxDyn(&[1]), grad_b),
        ))
    }
}

fn train(problem: &Problem, spec: OptimizerSpec) -> Result<()> {
    let mut opt = AnyOptimizer::from_spec(spec)?;
    let mut w = Parameter::new("weights", ArrayD::zeros(IxDyn(&[FEATURES, 1])));
    let mut b = Parameter::new("bias", ArrayD::zeros(IxDyn(&[1])));

    opt.build(&[&w, &b])?;
    info!("training with {}", opt.name());

    for step in 1..=STEPS {
        let (loss, grad_w, grad_b) = problem.loss_and_grads(&w, &b)?;

        if step == 1 || step % 50 == 0 {
            info!(optimizer = opt.name(), step = step, loss = loss; "training");
        }

        opt.apply_gradients(&mut [
            (Gradient::Dense(grad_w), &mut w),
            (Gradient::Dense(grad_b), &mut b),
        ])?;
    }

    opt.finalize_variable_values(&mut [&mut w, &mut b])?;

    let (loss, _, _) = problem.loss_and_grads(&w, &b)?;
    info!(optimizer = opt.name(), loss = loss; "finished training");
    info!("final config: {}", serde_json::to_string(&opt.get_config()?)?);

    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let specs = match env::args().nth(1) {
        Some(path) => {
            let raw =
                fs::read_to_string(&path).with_context(|| format!("failed to read {path}"))?;
            let spec =
                serde_json::from_str(&raw).with_context(|| format!("failed to parse {path}"))?;
            vec![spec]
        }
        None => OptimizerSpec::defaults().to_vec(),
    };

    let problem = Problem::generate(SEED)?;

    for spec in specs {
        train(&problem, spec)?;
    }

    Ok(())
}
