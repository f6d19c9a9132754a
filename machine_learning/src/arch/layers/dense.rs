use ndarray::{ArrayD, Ix2, linalg, prelude::*};

use crate::{MlErr, Result, arch::activations::ActFn};

/// A fully connected layer. Its weights are laid out as an `(in, out)` row major matrix
/// followed by `out` biases.
#[derive(Debug, Clone)]
pub struct Dense {
    dim: (usize, usize),
    act_fn: Option<ActFn>,
    size: usize,

    // Forward metadata
    x: Array2<f32>,
    z: Array2<f32>,
}

impl Dense {
    /// Creates a new `Dense` layer.
    ///
    /// # Arguments
    /// * `dim` - The amount of inputs and outputs.
    /// * `act_fn` - An optional activation applied to the outputs.
    pub fn new(dim: (usize, usize), act_fn: Option<ActFn>) -> Self {
        Self {
            dim,
            act_fn,
            size: (dim.0 + 1) * dim.1,
            x: Array2::zeros((0, dim.0)),
            z: Array2::zeros((0, dim.1)),
        }
    }

    /// Returns the amount of parameters this layer has.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the amount of inputs feeding each output.
    pub fn fan_in(&self) -> usize {
        self.dim.0
    }

    pub fn fan_out(&self) -> usize {
        self.dim.1
    }

    /// Computes the layer's output for a `(batch, in)` input.
    pub fn forward(&mut self, params: &[f32], x: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = x.into_dimensionality::<Ix2>()?;

        if x.ncols() != self.dim.0 {
            return Err(MlErr::ShapeMismatch {
                what: "dense input",
                got: x.shape().to_vec(),
                expected: vec![x.nrows(), self.dim.0],
            });
        }

        let (w, b) = self.view_params(params);
        let mut z = Array2::zeros((x.nrows(), self.dim.1));
        linalg::general_mat_mul(1.0, &x, &w, 0.0, &mut z);
        z += &b;

        let a = match self.act_fn {
            Some(act_fn) => z.mapv(|z| act_fn.f(z)),
            None => z.clone(),
        };

        self.x = x;
        self.z = z;
        Ok(a.into_dyn())
    }

    /// Writes this layer's gradient into `grad` and returns the delta for the previous layer.
    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayD<f32>,
    ) -> Result<ArrayD<f32>> {
        let mut d = d.into_dimensionality::<Ix2>()?;

        if d.dim() != self.z.dim() {
            return Err(MlErr::ShapeMismatch {
                what: "dense delta",
                got: d.shape().to_vec(),
                expected: self.z.shape().to_vec(),
            });
        }

        if let Some(act_fn) = self.act_fn {
            d.zip_mut_with(&self.z, |d, &z| *d *= act_fn.df(z));
        }

        let (mut dw, mut db) = self.view_grad(grad);
        linalg::general_mat_mul(1.0, &self.x.t(), &d, 0.0, &mut dw);
        db.assign(&d.sum_axis(Axis(0)));

        let (w, _) = self.view_params(params);
        let mut dx = Array2::zeros((d.nrows(), self.dim.0));
        linalg::general_mat_mul(1.0, &d, &w.t(), 0.0, &mut dx);

        Ok(dx.into_dyn())
    }

    /// Gives a view of the raw gradient slice as the delta weights and delta biases of this layer.
    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> (ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>) {
        let w_size = self.size - self.dim.1;
        let (dw_raw, db_raw) = grad.split_at_mut(w_size);

        // SAFETY: `Sequential` hands every layer a slice of exactly `size` elements.
        let dw = ArrayViewMut2::from_shape(self.dim, dw_raw).unwrap();
        let db = ArrayViewMut1::from_shape(self.dim.1, db_raw).unwrap();
        (dw, db)
    }

    /// Gives a view of the raw parameter slice as the weights and biases of this layer.
    fn view_params<'a>(&self, params: &'a [f32]) -> (ArrayView2<'a, f32>, ArrayView1<'a, f32>) {
        let w_size = self.size - self.dim.1;

        // SAFETY: `Sequential` hands every layer a slice of exactly `size` elements.
        let w = ArrayView2::from_shape(self.dim, &params[..w_size]).unwrap();
        let b = ArrayView1::from_shape(self.dim.1, &params[w_size..]).unwrap();
        (w, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_is_affine() {
        let mut dense = Dense::new((2, 1), None);
        let params = [2., -1., 0.5];
        let x = array![[1., 1.], [3., 0.]].into_dyn();

        let y = dense.forward(&params, x).unwrap();
        assert_eq!(y, array![[1.5], [6.5]].into_dyn());
    }

    #[test]
    fn backward_accumulates_bias_over_batch() {
        let mut dense = Dense::new((2, 1), None);
        let params = [2., -1., 0.5];
        let mut grad = [0.; 3];
        dense
            .forward(&params, array![[1., 1.], [3., 0.]].into_dyn())
            .unwrap();

        let dx = dense
            .backward(&params, &mut grad, array![[1.], [1.]].into_dyn())
            .unwrap();

        assert_eq!(grad, [4., 1., 2.]);
        assert_eq!(dx, array![[2., -1.], [2., -1.]].into_dyn());
    }

    #[test]
    fn wrong_input_width_is_rejected() {
        let mut dense = Dense::new((3, 1), None);
        let params = [0.; 4];
        let x = Array2::<f32>::zeros((2, 2)).into_dyn();

        assert!(matches!(
            dense.forward(&params, x),
            Err(MlErr::ShapeMismatch { .. })
        ));
    }
}
