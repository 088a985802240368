use std::borrow::Cow;

use ndarray::{ArrayD, Axis, IxDyn};

use crate::error::{OptimErr, Result};

/// A gradient handed to an optimizer by the host.
#[derive(Debug, Clone)]
pub enum Gradient {
    Dense(ArrayD<f32>),
    Sparse(SparseGradient),
}

impl Gradient {
    pub fn is_sparse(&self) -> bool {
        matches!(self, Gradient::Sparse(_))
    }

    /// Returns the shape of the dense array this gradient represents.
    pub fn shape(&self) -> &[usize] {
        match self {
            Gradient::Dense(grad) => grad.shape(),
            Gradient::Sparse(grad) => &grad.dense_shape,
        }
    }

    /// Returns the dense form of this gradient, materializing it if it's sparse.
    pub fn to_dense(&self) -> Cow<'_, ArrayD<f32>> {
        match self {
            Gradient::Dense(grad) => Cow::Borrowed(grad),
            Gradient::Sparse(grad) => Cow::Owned(grad.to_dense()),
        }
    }

    /// Gives mutable access to the stored values, the rows of a sparse gradient
    /// or the whole array of a dense one.
    pub(crate) fn values_mut(&mut self) -> &mut ArrayD<f32> {
        match self {
            Gradient::Dense(grad) => grad,
            Gradient::Sparse(grad) => &mut grad.values,
        }
    }
}

impl From<ArrayD<f32>> for Gradient {
    fn from(value: ArrayD<f32>) -> Self {
        Self::Dense(value)
    }
}

impl From<SparseGradient> for Gradient {
    fn from(value: SparseGradient) -> Self {
        Self::Sparse(value)
    }
}

/// A gradient that only touches some rows (slices along the first axis) of a parameter,
/// as produced for instance by embedding lookups.
#[derive(Debug, Clone)]
pub struct SparseGradient {
    indices: Vec<usize>,
    values: ArrayD<f32>,
    dense_shape: Vec<usize>,
}

impl SparseGradient {
    /// Creates a new `SparseGradient`.
    ///
    /// # Arguments
    /// * `indices` - The rows of the dense array touched by each slice of `values`.
    /// * `values` - The row slices, shaped `[indices.len(), dense_shape[1..]..]`.
    /// * `dense_shape` - The shape of the parameter this gradient belongs to.
    ///
    /// # Returns
    /// A new `SparseGradient` or an error if the shapes or the indices don't line up.
    pub fn new(indices: Vec<usize>, values: ArrayD<f32>, dense_shape: Vec<usize>) -> Result<Self> {
        let Some((&rows, rest)) = dense_shape.split_first() else {
            return Err(OptimErr::ShapeMismatch {
                what: "sparse gradient dense shape",
                got: dense_shape,
                expected: vec![1],
            });
        };

        let mut expected = Vec::with_capacity(dense_shape.len());
        expected.push(indices.len());
        expected.extend_from_slice(rest);

        if values.shape() != expected.as_slice() {
            return Err(OptimErr::ShapeMismatch {
                what: "sparse gradient values",
                got: values.shape().to_vec(),
                expected,
            });
        }

        if let Some(&idx) = indices.iter().find(|&&idx| idx >= rows) {
            return Err(OptimErr::InvalidConfig(format!(
                "sparse gradient index {idx} is out of bounds for {rows} rows"
            )));
        }

        Ok(Self {
            indices,
            values,
            dense_shape,
        })
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn values(&self) -> &ArrayD<f32> {
        &self.values
    }

    /// Scatters the row slices into a zeroed dense array, summing repeated indices.
    pub fn to_dense(&self) -> ArrayD<f32> {
        let mut dense = ArrayD::zeros(IxDyn(&self.dense_shape));

        for (row, &idx) in self.indices.iter().enumerate() {
            let mut dst = dense.index_axis_mut(Axis(0), idx);
            dst += &self.values.index_axis(Axis(0), row);
        }

        dense
    }
}
