use serde::{Deserialize, Serialize};

/// The specification for the `ActFn` enum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActFnSpec {
    Relu,
    Sigmoid { amp: f32 },
}

/// The specification for the `Layer` enum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerSpec {
    Conv2d {
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        act_fn: Option<ActFnSpec>,
    },
    MaxPool2d {
        size: usize,
    },
    Flatten,
    Dense {
        dim: (usize, usize),
        act_fn: Option<ActFnSpec>,
    },
}

/// How the initial parameters of every layer are drawn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitSpec {
    /// Uniform over `±1/sqrt(fan_in)`.
    #[default]
    FanInUniform,
    XavierUniform,
    LecunUniform,
    Kaiming,
    Normal {
        mean: f32,
        std_dev: f32,
    },
    Const {
        value: f32,
    },
}

/// The specification for a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSpec {
    Sequential {
        input_shape: Vec<usize>,
        layers: Vec<LayerSpec>,
        #[serde(default)]
        init: InitSpec,
    },
}

/// The specification for the `Optimizer` trait.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerSpec {
    Adam {
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    },
    GradientDescent {
        learning_rate: f32,
    },
    GradientDescentWithMomentum {
        learning_rate: f32,
        momentum: f32,
    },
}

/// The specification for the `LossFn` trait.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossFnSpec {
    Mse,
    CrossEntropy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_defaults_to_fan_in_uniform() {
        let json = r#"{"sequential":{"input_shape":[2],"layers":[{"dense":{"dim":[2,1]}}]}}"#;
        let spec: ModelSpec = serde_json::from_str(json).unwrap();

        let ModelSpec::Sequential { init, .. } = spec;
        assert_eq!(init, InitSpec::FanInUniform);
    }

    #[test]
    fn init_is_tagged_by_name() {
        let init: InitSpec = serde_json::from_str(r#"{"const":{"value":0.5}}"#).unwrap();
        assert_eq!(init, InitSpec::Const { value: 0.5 });

        let init: InitSpec = serde_json::from_str(r#""kaiming""#).unwrap();
        assert_eq!(init, InitSpec::Kaiming);
    }
}
