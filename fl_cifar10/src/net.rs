use comms::specs::model::{ActFnSpec, InitSpec, LayerSpec, LossFnSpec, ModelSpec, OptimizerSpec};
use federation::{ModelInterface, Result};

use crate::{
    cifar10::{CLASSES, IMAGE_SHAPE},
    config::TrainingConfig,
};

fn conv(in_channels: usize, out_channels: usize) -> LayerSpec {
    LayerSpec::Conv2d {
        in_channels,
        out_channels,
        kernel: 5,
        stride: 1,
        padding: 0,
        act_fn: Some(ActFnSpec::Relu),
    }
}

fn dense(dim: (usize, usize), act_fn: Option<ActFnSpec>) -> LayerSpec {
    LayerSpec::Dense { dim, act_fn }
}

/// The small CNN of the tutorial, two convolution blocks followed by three dense layers.
///
/// `3x32x32 -> conv 6 -> pool -> conv 16 -> pool -> 400 -> 120 -> 84 -> 10`
pub fn cnn_spec() -> ModelSpec {
    ModelSpec::Sequential {
        input_shape: IMAGE_SHAPE.to_vec(),
        layers: vec![
            conv(3, 6),
            LayerSpec::MaxPool2d { size: 2 },
            conv(6, 16),
            LayerSpec::MaxPool2d { size: 2 },
            LayerSpec::Flatten,
            dense((16 * 5 * 5, 120), Some(ActFnSpec::Relu)),
            dense((120, 84), Some(ActFnSpec::Relu)),
            dense((84, CLASSES), None),
        ],
        init: InitSpec::FanInUniform,
    }
}

/// The CNN with freshly initialized parameters, trained by SGD with momentum on
/// cross entropy.
pub fn cnn_model(config: &TrainingConfig) -> Result<ModelInterface> {
    let optimizer = OptimizerSpec::GradientDescentWithMomentum {
        learning_rate: config.learning_rate,
        momentum: config.momentum,
    };

    ModelInterface::new(cnn_spec(), optimizer, LossFnSpec::CrossEntropy, config.seed)
}
