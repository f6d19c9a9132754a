use ndarray::{ArrayD, Ix4, IxDyn, prelude::*};

use crate::{MlErr, Result};

/// Non overlapping max pooling over square windows of `(batch, channels, height, width)` inputs.
/// Trailing rows and columns that do not fill a window are dropped.
#[derive(Debug, Clone)]
pub struct MaxPool2d {
    size: usize,

    // Forward metadata
    input_shape: Vec<usize>,
    argmax: Vec<usize>,
}

impl MaxPool2d {
    /// Creates a new `MaxPool2d` layer.
    ///
    /// # Returns
    /// An error if `size` is zero.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(MlErr::InvalidLayer("max pool window must not be empty".into()));
        }

        Ok(Self {
            size,
            input_shape: Vec::new(),
            argmax: Vec::new(),
        })
    }

    pub fn forward(&mut self, x: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = x.into_dimensionality::<Ix4>()?;
        let (n, c, h, w) = x.dim();
        let s = self.size;
        let (ho, wo) = (h / s, w / s);

        if ho == 0 || wo == 0 {
            return Err(MlErr::InvalidLayer(format!(
                "max pool window {s} does not fit a {h}x{w} input"
            )));
        }

        let mut out = Array4::zeros((n, c, ho, wo));
        self.argmax.clear();
        self.argmax.reserve(out.len());

        for ((ni, ci, oh, ow), o) in out.indexed_iter_mut() {
            let flat = |ih, iw| ((ni * c + ci) * h + ih) * w + iw;
            let (h0, w0) = (oh * s, ow * s);
            let mut best = (x[[ni, ci, h0, w0]], flat(h0, w0));

            for ih in h0..h0 + s {
                for iw in w0..w0 + s {
                    let v = x[[ni, ci, ih, iw]];
                    if v > best.0 {
                        best = (v, flat(ih, iw));
                    }
                }
            }

            *o = best.0;
            self.argmax.push(best.1);
        }

        self.input_shape = x.shape().to_vec();
        Ok(out.into_dyn())
    }

    /// Routes every delta to the input position that won its window.
    pub fn backward(&mut self, d: ArrayD<f32>) -> Result<ArrayD<f32>> {
        if d.len() != self.argmax.len() {
            return Err(MlErr::SizeMismatch {
                what: "max pool delta",
                got: d.len(),
                expected: self.argmax.len(),
            });
        }

        let mut dx = vec![0.; self.input_shape.iter().product()];
        for (&g, &i) in d.iter().zip(&self.argmax) {
            dx[i] += g;
        }

        Ok(ArrayD::from_shape_vec(IxDyn(&self.input_shape), dx)?)
    }
}
