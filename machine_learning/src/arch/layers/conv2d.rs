use ndarray::{ArrayD, Ix4, Zip, linalg, prelude::*};

use crate::{MlErr, Result, arch::activations::ActFn};

/// Spatial geometry of a convolution over one input size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Geometry {
    kernel: usize,
    stride: usize,
    padding: usize,
    h: usize,
    w: usize,
    ho: usize,
    wo: usize,
}

/// A 2D convolution over `(batch, channels, height, width)` inputs.
///
/// The weights are laid out as `(out_channels, in_channels, kernel, kernel)` followed by
/// `out_channels` biases. The forward pass lowers every sample into a column matrix so the
/// convolution becomes one matrix product per sample.
#[derive(Debug, Clone)]
pub struct Conv2d {
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    act_fn: Option<ActFn>,
    size: usize,

    // Forward metadata
    geometry: Geometry,
    batch: usize,
    cols: Array3<f32>,
    z: Array3<f32>,
}

impl Conv2d {
    /// Creates a new `Conv2d` layer.
    ///
    /// # Arguments
    /// * `in_channels` - The amount of channels of the input.
    /// * `out_channels` - The amount of filters, and therefore output channels.
    /// * `kernel` - The side of the square filters.
    /// * `stride` - The step between filter applications.
    /// * `padding` - The amount of zeros surrounding the input on every side.
    /// * `act_fn` - An optional activation applied to the outputs.
    ///
    /// # Returns
    /// An error if the kernel or the stride is zero.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        act_fn: Option<ActFn>,
    ) -> Result<Self> {
        if kernel == 0 || stride == 0 || in_channels == 0 || out_channels == 0 {
            return Err(MlErr::InvalidLayer(format!(
                "conv2d needs non zero channels, kernel and stride, \
                 got {in_channels}->{out_channels} kernel {kernel} stride {stride}"
            )));
        }

        let ckk = in_channels * kernel * kernel;

        Ok(Self {
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            act_fn,
            size: (ckk + 1) * out_channels,
            geometry: Geometry::default(),
            batch: 0,
            cols: Array3::zeros((0, ckk, 0)),
            z: Array3::zeros((0, out_channels, 0)),
        })
    }

    /// Returns the amount of parameters this layer has.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the amount of inputs feeding each output.
    pub fn fan_in(&self) -> usize {
        self.in_channels * self.kernel * self.kernel
    }

    /// Returns the amount of outputs each input feeds.
    pub fn fan_out(&self) -> usize {
        self.out_channels * self.kernel * self.kernel
    }

    fn geometry(&self, h: usize, w: usize) -> Result<Geometry> {
        let Self {
            kernel,
            stride,
            padding,
            ..
        } = *self;

        if h + 2 * padding < kernel || w + 2 * padding < kernel {
            return Err(MlErr::InvalidLayer(format!(
                "conv2d kernel {kernel} does not fit a {h}x{w} input with padding {padding}"
            )));
        }

        Ok(Geometry {
            kernel,
            stride,
            padding,
            h,
            w,
            ho: (h + 2 * padding - kernel) / stride + 1,
            wo: (w + 2 * padding - kernel) / stride + 1,
        })
    }

    /// Computes the layer's output for a `(batch, in_channels, h, w)` input.
    pub fn forward(&mut self, params: &[f32], x: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = x.into_dimensionality::<Ix4>()?;
        let (n, c, h, w) = x.dim();

        if c != self.in_channels {
            return Err(MlErr::ShapeMismatch {
                what: "conv2d input channels",
                got: x.shape().to_vec(),
                expected: vec![n, self.in_channels, h, w],
            });
        }

        let g = self.geometry(h, w)?;
        let spatial = g.ho * g.wo;

        let mut cols = Array3::zeros((n, self.fan_in(), spatial));
        Zip::from(cols.outer_iter_mut())
            .and(x.outer_iter())
            .par_for_each(|col, xi| im2col(xi, col, g));

        let (weights, biases) = self.view_params(params);
        let biases = biases.insert_axis(Axis(1));

        let mut z = Array3::zeros((n, self.out_channels, spatial));
        Zip::from(z.outer_iter_mut())
            .and(cols.outer_iter())
            .par_for_each(|mut zi, ci| {
                linalg::general_mat_mul(1.0, &weights, &ci, 0.0, &mut zi);
                zi += &biases;
            });

        let a = match self.act_fn {
            Some(act_fn) => z.mapv(|z| act_fn.f(z)),
            None => z.clone(),
        };

        self.geometry = g;
        self.batch = n;
        self.cols = cols;
        self.z = z;

        let a = a.into_shape_with_order((n, self.out_channels, g.ho, g.wo))?;
        Ok(a.into_dyn())
    }

    /// Writes this layer's gradient into `grad` and returns the delta for the previous layer.
    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayD<f32>,
    ) -> Result<ArrayD<f32>> {
        let g = self.geometry;
        let n = self.batch;
        let expected = [n, self.out_channels, g.ho, g.wo];

        if d.shape() != expected {
            return Err(MlErr::ShapeMismatch {
                what: "conv2d delta",
                got: d.shape().to_vec(),
                expected: expected.to_vec(),
            });
        }

        let mut d = d.into_shape_with_order((n, self.out_channels, g.ho * g.wo))?;

        if let Some(act_fn) = self.act_fn {
            d.zip_mut_with(&self.z, |d, &z| *d *= act_fn.df(z));
        }

        let (mut dw, mut db) = self.view_grad(grad);
        dw.fill(0.);
        for (di, ci) in d.outer_iter().zip(self.cols.outer_iter()) {
            linalg::general_mat_mul(1.0, &di, &ci.t(), 1.0, &mut dw);
        }
        db.assign(&d.sum_axis(Axis(2)).sum_axis(Axis(0)));

        let (weights, _) = self.view_params(params);
        let fan_in = self.fan_in();

        let mut dx = Array4::zeros((n, self.in_channels, g.h, g.w));
        Zip::from(dx.outer_iter_mut())
            .and(d.outer_iter())
            .par_for_each(|dxi, di| {
                let mut dcols = Array2::zeros((fan_in, g.ho * g.wo));
                linalg::general_mat_mul(1.0, &weights.t(), &di, 0.0, &mut dcols);
                col2im(dcols.view(), dxi, g);
            });

        Ok(dx.into_dyn())
    }

    /// Gives a view of the raw gradient slice as the delta filters and delta biases of this layer.
    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> (ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>) {
        let w_size = self.size - self.out_channels;
        let (dw_raw, db_raw) = grad.split_at_mut(w_size);

        // SAFETY: `Sequential` hands every layer a slice of exactly `size` elements.
        let dw = ArrayViewMut2::from_shape((self.out_channels, self.fan_in()), dw_raw).unwrap();
        let db = ArrayViewMut1::from_shape(self.out_channels, db_raw).unwrap();
        (dw, db)
    }

    /// Gives a view of the raw parameter slice as the filters and biases of this layer.
    fn view_params<'a>(&self, params: &'a [f32]) -> (ArrayView2<'a, f32>, ArrayView1<'a, f32>) {
        let w_size = self.size - self.out_channels;

        // SAFETY: `Sequential` hands every layer a slice of exactly `size` elements.
        let w = ArrayView2::from_shape((self.out_channels, self.fan_in()), &params[..w_size])
            .unwrap();
        let b = ArrayView1::from_shape(self.out_channels, &params[w_size..]).unwrap();
        (w, b)
    }
}

/// Maps the input position read by filter tap `k` at output position `o`, `None` if it
/// falls on the padding.
fn source(o: usize, k: usize, g: Geometry, limit: usize) -> Option<usize> {
    (o * g.stride + k)
        .checked_sub(g.padding)
        .filter(|&i| i < limit)
}

/// Lowers a `(c, h, w)` sample into a `(c * k * k, ho * wo)` column matrix.
fn im2col(x: ArrayView3<f32>, mut cols: ArrayViewMut2<f32>, g: Geometry) {
    let k = g.kernel;

    for ((ch, ki, kj), mut row) in (0..x.dim().0)
        .flat_map(|ch| (0..k).flat_map(move |ki| (0..k).map(move |kj| (ch, ki, kj))))
        .zip(cols.outer_iter_mut())
    {
        for oh in 0..g.ho {
            let Some(ih) = source(oh, ki, g, g.h) else {
                continue;
            };

            for ow in 0..g.wo {
                if let Some(iw) = source(ow, kj, g, g.w) {
                    row[oh * g.wo + ow] = x[[ch, ih, iw]];
                }
            }
        }
    }
}

/// Scatters a column matrix back onto a `(c, h, w)` sample, adding overlapping taps.
fn col2im(cols: ArrayView2<f32>, mut dx: ArrayViewMut3<f32>, g: Geometry) {
    let k = g.kernel;

    for ((ch, ki, kj), row) in (0..dx.dim().0)
        .flat_map(|ch| (0..k).flat_map(move |ki| (0..k).map(move |kj| (ch, ki, kj))))
        .zip(cols.outer_iter())
    {
        for oh in 0..g.ho {
            let Some(ih) = source(oh, ki, g, g.h) else {
                continue;
            };

            for ow in 0..g.wo {
                if let Some(iw) = source(ow, kj, g, g.w) {
                    dx[[ch, ih, iw]] += row[oh * g.wo + ow];
                }
            }
        }
    }
}
