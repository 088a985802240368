use std::sync::atomic::AtomicU64;

use bounded_optim::{
    AdaBound, AdaMod, Gradient,
    optimization::{StepContext, UpdateRule, bias_corrections, projection},
};
use ndarray::{Array2, ArrayD, IxDyn, arr1};
use proptest::prelude::*;

fn matrix(rows: usize, cols: usize) -> impl Strategy<Value = Array2<f32>> {
    prop::collection::vec(0.1f32..10., rows * cols)
        .prop_map(move |values| Array2::from_shape_vec((rows, cols), values).unwrap())
}

fn close(a: f32, b: f32) -> bool {
    (a - b).abs() <= 1e-4 * (1. + a.abs().max(b.abs()))
}

proptest! {
    #[test]
    fn adabound_bounds_tighten_monotonically(
        gamma in 1e-4f32..1.,
        final_lr in 1e-3f32..1.,
        step in 1u64..100_000,
    ) {
        let rule = AdaBound { gamma, final_lr, ..Default::default() };

        let (lower, upper) = rule.bounds(final_lr, step);
        let (next_lower, next_upper) = rule.bounds(final_lr, step + 1);

        prop_assert!(lower <= upper);
        prop_assert!(lower <= next_lower);
        prop_assert!(next_upper <= upper);
    }

    #[test]
    fn adamod_cap_never_exceeds_raw_step(
        grads in prop::collection::vec(-10f32..10., 1..40),
        lr in 1e-4f32..1e-1,
    ) {
        let rule = AdaMod::default();
        let shared = AtomicU64::new(0);
        let ctx = StepContext { lr, base_lr: lr, shared_step: &shared };

        let mut p = arr1(&[0f32]).into_dyn();
        let mut state = rule.init_state(&p);

        for (t, g) in grads.into_iter().enumerate() {
            let before = p[[0]];
            rule.update(&ctx, &Gradient::Dense(arr1(&[g]).into_dyn()), &mut p, &mut state).unwrap();

            let (bc1, bc2) = bias_corrections(rule.beta1, rule.beta2, t as u64 + 1);
            let raw = lr * bc2.sqrt() / bc1 / (state.exp_avg_sq[[0]].sqrt() + rule.epsilon);
            let moved = (before - p[[0]]).abs();
            let slack = 2. * f32::EPSILON * before.abs().max(p[[0]].abs());

            prop_assert!(state.exp_avg_lr[[0]] >= 0.);
            prop_assert!(moved <= raw * state.exp_avg[[0]].abs() * (1. + 1e-4) + slack);
        }
    }

    #[test]
    fn projection_is_idempotent(
        param in matrix(3, 4),
        grad in matrix(3, 4),
        perturb in matrix(3, 4),
        flip in prop::bool::ANY,
    ) {
        // Flipping alternate signs makes the gradient close to orthogonal now and then.
        let grad = if flip {
            ArrayD::from_shape_fn(IxDyn(grad.shape()), |idx| {
                let sign = if (idx[0] + idx[1]) % 2 == 0 { 1. } else { -1. };
                sign * grad[[idx[0], idx[1]]]
            })
        } else {
            grad.into_dyn()
        };
        let param = param.into_dyn();

        let project = |perturb: &mut ArrayD<f32>| {
            projection::project(param.view(), grad.view(), perturb, 0.1, 0.1, 1e-8).unwrap()
        };

        let mut once = perturb.into_dyn();
        let first = project(&mut once);

        let mut twice = once.clone();
        let second = project(&mut twice);

        prop_assert_eq!(first, second);
        prop_assert!(once.iter().zip(&twice).all(|(&a, &b)| close(a, b)));
    }

    #[test]
    fn aligned_gradient_leaves_update_alone(
        param in matrix(4, 3),
        perturb in matrix(4, 3),
        scale in 0.1f32..10.,
    ) {
        let grad = param.mapv(|v| v * scale).into_dyn();
        let param = param.into_dyn();
        let mut projected = perturb.clone().into_dyn();

        let wd_ratio =
            projection::project(param.view(), grad.view(), &mut projected, 0.1, 0.1, 1e-8)
                .unwrap();

        prop_assert_eq!(wd_ratio, 1.);
        prop_assert_eq!(projected, perturb.into_dyn());
    }
}
