use ndarray::ArrayD;

use crate::{MlErr, Result};

/// Collapses every axis but the batch one.
#[derive(Debug, Clone, Default)]
pub struct Flatten {
    input_shape: Vec<usize>,
}

impl Flatten {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forward(&mut self, x: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let Some(&n) = x.shape().first() else {
            return Err(MlErr::ShapeMismatch {
                what: "flatten input",
                got: Vec::new(),
                expected: vec![0, 0],
            });
        };

        self.input_shape = x.shape().to_vec();
        let features = x.len().checked_div(n).unwrap_or_default();
        Ok(x.into_shape_with_order((n, features))?.into_dyn())
    }

    pub fn backward(&mut self, d: ArrayD<f32>) -> Result<ArrayD<f32>> {
        Ok(d.into_shape_with_order(self.input_shape.clone())?)
    }
}
