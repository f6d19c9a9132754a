use comms::specs::model::{ActFnSpec, LayerSpec, ModelSpec};

use super::{Sequential, activations::ActFn, layers::Layer};
use crate::{
    Result,
    arch::layers::{Conv2d, MaxPool2d},
};

/// Builds models given a specification.
#[derive(Debug, Default)]
pub struct ModelBuilder;

impl ModelBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Builds a new model following `spec`.
    ///
    /// # Returns
    /// An error if any of the layers is invalid.
    pub fn build(&self, spec: &ModelSpec) -> Result<Sequential> {
        match spec {
            ModelSpec::Sequential {
                input_shape,
                layers,
                ..
            } => {
                let layers = layers
                    .iter()
                    .map(|ls| self.resolve_layer(*ls))
                    .collect::<Result<Vec<_>>>()?;

                Ok(Sequential::new(input_shape.clone(), layers))
            }
        }
    }

    fn resolve_layer(&self, spec: LayerSpec) -> Result<Layer> {
        let layer = match spec {
            LayerSpec::Conv2d {
                in_channels,
                out_channels,
                kernel,
                stride,
                padding,
                act_fn,
            } => {
                let act_fn = self.resolve_act_fn(act_fn);
                let conv = Conv2d::new(in_channels, out_channels, kernel, stride, padding, act_fn)?;
                Layer::Conv2d(conv)
            }
            LayerSpec::MaxPool2d { size } => Layer::MaxPool2d(MaxPool2d::new(size)?),
            LayerSpec::Flatten => Layer::flatten(),
            LayerSpec::Dense { dim, act_fn } => Layer::dense(dim, self.resolve_act_fn(act_fn)),
        };

        Ok(layer)
    }

    fn resolve_act_fn(&self, spec: Option<ActFnSpec>) -> Option<ActFn> {
        spec.map(|act_fn| match act_fn {
            ActFnSpec::Relu => ActFn::relu(),
            ActFnSpec::Sigmoid { amp } => ActFn::sigmoid(amp),
        })
    }
}
