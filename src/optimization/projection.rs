use ndarray::{Array1, ArrayD, ArrayView2, ArrayViewD, Axis, Zip};

use crate::error::{OptimErr, Result};

/// The two ways AdamP looks at a multi-dimensional parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    /// One row per output channel, the first axis is kept and the rest flattened.
    Channel,
    /// A single row holding the whole parameter.
    Layer,
}

impl View {
    /// Returns the `(rows, cols)` this view gives to an array of the given shape.
    pub fn dims(self, shape: &[usize]) -> (usize, usize) {
        let total: usize = shape.iter().product();

        match self {
            View::Channel => {
                let rows = shape.first().copied().unwrap_or(1);
                (rows, total.checked_div(rows).unwrap_or(0))
            }
            View::Layer => (1, total),
        }
    }
}

/// Computes the absolute cosine similarity between matching rows of `x1` and `x2`.
///
/// The product of the squared norms is floored at `eps^2` before taking its
/// square root.
pub fn cosine_similarity(x1: ArrayView2<f32>, x2: ArrayView2<f32>, eps: f32) -> Array1<f32> {
    Zip::from(x1.rows())
        .and(x2.rows())
        .map_collect(|a, b| {
            let w12 = a.dot(&b);
            let w1 = a.dot(&a);
            let w2 = b.dot(&b);
            let n12 = (w1 * w2).max(eps * eps).min(f32::MAX).sqrt();
            (w12 / n12).abs()
        })
}

/// Removes from `perturb` its radial component when the gradient is nearly
/// orthogonal to the parameter, so the step can't inflate the parameter's norm.
///
/// The channel view is tried first, then the layer view, and the first one whose
/// largest cosine similarity falls below `delta / sqrt(cols)` is used.
///
/// # Arguments
/// * `param` - The parameter, with at least two dimensions.
/// * `grad` - The gradient, same shape as `param`.
/// * `perturb` - The update direction, modified in place when projected.
/// * `delta` - The orthogonality threshold.
/// * `wd_ratio` - The weight decay ratio to use when projected.
/// * `eps` - The norm floor.
///
/// # Returns
/// The weight decay ratio to apply: `wd_ratio` if projected, `1` otherwise.
pub fn project(
    param: ArrayViewD<f32>,
    grad: ArrayViewD<f32>,
    perturb: &mut ArrayD<f32>,
    delta: f32,
    wd_ratio: f32,
    eps: f32,
) -> Result<f32> {
    for view in [View::Channel, View::Layer] {
        let (rows, cols) = view.dims(param.shape());

        if rows == 0 || cols == 0 {
            continue;
        }

        let reshape_err = |got: &[usize]| OptimErr::ShapeMismatch {
            what: "projection view",
            got: got.to_vec(),
            expected: vec![rows, cols],
        };

        let p = param
            .to_shape((rows, cols))
            .map_err(|_| reshape_err(param.shape()))?;
        let g = grad
            .to_shape((rows, cols))
            .map_err(|_| reshape_err(grad.shape()))?;

        let cosine = cosine_similarity(p.view(), g.view(), eps);
        let max = cosine.fold(f32::NEG_INFINITY, |acc, &c| acc.max(c));

        if max >= delta / (cols as f32).sqrt() {
            continue;
        }

        let norms = p.map_axis(Axis(1), |row| row.dot(&row).sqrt() + eps);
        let unit = &p / &norms.insert_axis(Axis(1));

        let mut d = perturb
            .to_shape((rows, cols))
            .map_err(|_| reshape_err(perturb.shape()))?
            .into_owned();

        Zip::from(d.rows_mut())
            .and(unit.rows())
            .for_each(|mut d_row, u_row| {
                let radial = u_row.dot(&d_row);
                d_row.scaled_add(-radial, &u_row);
            });

        let dim = perturb.raw_dim();
        *perturb = d
            .into_shape_with_order(dim)
            .map_err(|_| reshape_err(&[rows, cols]))?;

        return Ok(wd_ratio);
    }

    Ok(1.)
}
