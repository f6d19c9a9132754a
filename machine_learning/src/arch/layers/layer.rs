use ndarray::ArrayD;

use super::{Conv2d, Dense, Flatten, MaxPool2d};
use crate::{Result, arch::activations::ActFn};

#[derive(Debug, Clone)]
pub enum Layer {
    Conv2d(Conv2d),
    MaxPool2d(MaxPool2d),
    Flatten(Flatten),
    Dense(Dense),
}

impl Layer {
    pub fn conv2d(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        act_fn: Option<ActFn>,
    ) -> Result<Self> {
        Conv2d::new(in_channels, out_channels, kernel, 1, 0, act_fn).map(Self::Conv2d)
    }

    pub fn max_pool2d(size: usize) -> Result<Self> {
        MaxPool2d::new(size).map(Self::MaxPool2d)
    }

    pub fn flatten() -> Self {
        Self::Flatten(Flatten::new())
    }

    pub fn dense(dim: (usize, usize), act_fn: Option<ActFn>) -> Self {
        Self::Dense(Dense::new(dim, act_fn))
    }

    /// Returns the amount of parameters this layer has.
    pub fn size(&self) -> usize {
        match self {
            Self::Conv2d(l) => l.size(),
            Self::Dense(l) => l.size(),
            Self::MaxPool2d(_) | Self::Flatten(_) => 0,
        }
    }

    /// Returns the amount of inputs feeding each output, `None` for layers without parameters.
    pub fn fan_in(&self) -> Option<usize> {
        match self {
            Self::Conv2d(l) => Some(l.fan_in()),
            Self::Dense(l) => Some(l.fan_in()),
            Self::MaxPool2d(_) | Self::Flatten(_) => None,
        }
    }

    pub fn fan_out(&self) -> Option<usize> {
        match self {
            Self::Conv2d(l) => Some(l.fan_out()),
            Self::Dense(l) => Some(l.fan_out()),
            Self::MaxPool2d(_) | Self::Flatten(_) => None,
        }
    }

    pub fn forward(&mut self, params: &[f32], x: ArrayD<f32>) -> Result<ArrayD<f32>> {
        match self {
            Self::Conv2d(l) => l.forward(params, x),
            Self::MaxPool2d(l) => l.forward(x),
            Self::Flatten(l) => l.forward(x),
            Self::Dense(l) => l.forward(params, x),
        }
    }

    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayD<f32>,
    ) -> Result<ArrayD<f32>> {
        match self {
            Self::Conv2d(l) => l.backward(params, grad, d),
            Self::MaxPool2d(l) => l.backward(d),
            Self::Flatten(l) => l.backward(d),
            Self::Dense(l) => l.backward(params, grad, d),
        }
    }
}
