use std::{cell::RefCell, rc::Rc};

use comms::specs::model::InitSpec;
use ndarray::{Array2, ArrayD, Ix2};
use rand::Rng;

use super::layers::Layer;
use crate::{
    MlErr, Result,
    initialization::{ChainedParamGen, ConstParamGen, ParamGen, RandParamGen},
};

/// A sequential model: information flows forward when computing an output and backward when
/// computing the *deltas* of its layers.
///
/// The model does not own its parameters, every call receives one flat slice holding the
/// parameters of all layers in order.
#[derive(Debug, Clone)]
pub struct Sequential {
    input_shape: Vec<usize>,
    layers: Vec<Layer>,
}

impl Sequential {
    /// Creates a new `Sequential`.
    ///
    /// # Arguments
    /// * `input_shape` - The shape of a single sample, without the batch axis.
    /// * `layers` - The layers the sequential is composed of.
    pub fn new<I>(input_shape: Vec<usize>, layers: I) -> Self
    where
        I: IntoIterator<Item = Layer>,
    {
        Self {
            input_shape,
            layers: layers.into_iter().collect(),
        }
    }

    /// Returns the amount of parameters in the model.
    pub fn size(&self) -> usize {
        self.layers.iter().map(Layer::size).sum()
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Makes a forward pass through the network.
    ///
    /// # Arguments
    /// * `params` - The parameters of every layer.
    /// * `x` - A batch of samples, shaped `(batch, input_shape..)`.
    ///
    /// # Returns
    /// The `(batch, outputs)` prediction or an error if the shapes do not line up.
    pub fn forward(&mut self, params: &[f32], x: ArrayD<f32>) -> Result<Array2<f32>> {
        self.check_size("parameters", params.len())?;

        if x.shape().get(1..) != Some(self.input_shape.as_slice()) {
            let mut expected = vec![x.shape().first().copied().unwrap_or_default()];
            expected.extend(&self.input_shape);

            return Err(MlErr::ShapeMismatch {
                what: "model input",
                got: x.shape().to_vec(),
                expected,
            });
        }

        let mut rest = params;
        let mut x = x;

        for layer in self.layers.iter_mut() {
            let (front, back) = rest.split_at(layer.size());
            x = layer.forward(front, x)?;
            rest = back;
        }

        Ok(x.into_dimensionality::<Ix2>()?)
    }

    /// Backpropagates the loss delta `d` of the last forward pass, writing the gradient of
    /// every layer into `grad`.
    pub fn backward(&mut self, params: &[f32], grad: &mut [f32], d: Array2<f32>) -> Result<()> {
        self.check_size("parameters", params.len())?;
        self.check_size("gradient", grad.len())?;

        let mut end = params.len();
        let mut d = d.into_dyn();

        for layer in self.layers.iter_mut().rev() {
            let start = end - layer.size();
            d = layer.backward(&params[start..end], &mut grad[start..end], d)?;
            end = start;
        }

        Ok(())
    }

    /// Builds a generator for the initial parameters of every layer.
    ///
    /// Weights and biases of each layer are drawn from `init`, scaled by the layer's fans.
    pub fn param_gen<R: Rng + 'static>(
        &self,
        rng: Rc<RefCell<R>>,
        init: InitSpec,
    ) -> Result<ChainedParamGen> {
        let mut gens: Vec<Box<dyn ParamGen>> = Vec::new();

        for layer in &self.layers {
            let (Some(fan_in), Some(fan_out)) = (layer.fan_in(), layer.fan_out()) else {
                continue;
            };

            let rng = rng.clone();
            let limit = layer.size();

            let param_gen: Box<dyn ParamGen> = match init {
                InitSpec::FanInUniform => {
                    let bound = 1. / (fan_in as f32).sqrt();
                    Box::new(RandParamGen::uniform(rng, limit, -bound, bound)?)
                }
                InitSpec::XavierUniform => {
                    Box::new(RandParamGen::xavier_uniform(rng, limit, fan_in, fan_out)?)
                }
                InitSpec::LecunUniform => {
                    Box::new(RandParamGen::lecun_uniform(rng, limit, fan_in)?)
                }
                InitSpec::Kaiming => Box::new(RandParamGen::kaiming(rng, limit, fan_in)?),
                InitSpec::Normal { mean, std_dev } => {
                    Box::new(RandParamGen::normal(rng, limit, mean, std_dev)?)
                }
                InitSpec::Const { value } => Box::new(ConstParamGen::new(value, limit)),
            };

            gens.push(param_gen);
        }

        Ok(ChainedParamGen::new(gens))
    }

    /// Samples a fresh parameter vector for this model.
    pub fn init_params<R: Rng + 'static>(
        &self,
        rng: Rc<RefCell<R>>,
        init: InitSpec,
    ) -> Result<Vec<f32>> {
        let size = self.size();
        let params = self.param_gen(rng, init)?.sample(size).unwrap_or_default();
        self.check_size("initial parameters", params.len())?;
        Ok(params)
    }

    fn check_size(&self, what: &'static str, got: usize) -> Result<()> {
        let expected = self.size();

        if got != expected {
            return Err(MlErr::SizeMismatch {
                what,
                got,
                expected,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array4, array};
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::arch::activations::ActFn;

    fn lenet_like() -> Sequential {
        Sequential::new(
            vec![3, 12, 12],
            [
                Layer::conv2d(3, 4, 3, Some(ActFn::relu())).unwrap(),
                Layer::max_pool2d(2).unwrap(),
                Layer::flatten(),
                Layer::dense((4 * 5 * 5, 10), None),
            ],
        )
    }

    #[test]
    fn forward_yields_one_row_per_sample() {
        let mut model = lenet_like();
        let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(3)));
        let params = model.init_params(rng, InitSpec::default()).unwrap();

        let x = Array4::zeros((5, 3, 12, 12)).into_dyn();
        let y = model.forward(&params, x).unwrap();
        assert_eq!(y.dim(), (5, 10));
    }

    #[test]
    fn init_params_respects_fan_in_bounds() {
        let model = lenet_like();
        let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(3)));
        let params = model.init_params(rng, InitSpec::FanInUniform).unwrap();

        let conv_size = 4 * 27 + 4;
        let conv_bound = 1. / 27f32.sqrt();
        let dense_bound = 1. / 100f32.sqrt();

        assert_eq!(params.len(), model.size());
        assert!(params[..conv_size].iter().all(|p| p.abs() <= conv_bound));
        assert!(params[conv_size..].iter().all(|p| p.abs() <= dense_bound));
    }

    #[test]
    fn xavier_and_lecun_bounds_follow_each_layer() {
        let model = lenet_like();
        let conv_size = 4 * 27 + 4;

        let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(3)));
        let params = model.init_params(rng, InitSpec::XavierUniform).unwrap();
        let conv_bound = (6. / (27. + 36.) as f32).sqrt();
        let dense_bound = (6. / 110f32).sqrt();

        assert!(params[..conv_size].iter().all(|p| p.abs() <= conv_bound));
        assert!(params[conv_size..].iter().all(|p| p.abs() <= dense_bound));

        let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(3)));
        let params = model.init_params(rng, InitSpec::LecunUniform).unwrap();
        let dense_bound = (3. / 100f32).sqrt();

        assert_eq!(params.len(), model.size());
        assert!(params[conv_size..].iter().all(|p| p.abs() <= dense_bound));
    }

    #[test]
    fn normal_initializers_are_seeded() {
        let model = lenet_like();
        let sample = |init| {
            let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(9)));
            model.init_params(rng, init).unwrap()
        };

        let kaiming = sample(InitSpec::Kaiming);
        assert_eq!(kaiming.len(), model.size());
        assert_eq!(kaiming, sample(InitSpec::Kaiming));

        let normal = sample(InitSpec::Normal {
            mean: 0.,
            std_dev: 0.01,
        });
        assert_ne!(normal, kaiming);
    }

    #[test]
    fn const_initializer_fills_every_layer() {
        let model = lenet_like();
        let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(0)));
        let init = InitSpec::Const { value: 0.25 };
        let params = model.init_params(rng, init).unwrap();

        assert_eq!(params, vec![0.25; model.size()]);
    }

    #[test]
    fn invalid_initializer_is_rejected() {
        let model = lenet_like();
        let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(0)));
        let init = InitSpec::Normal {
            mean: 0.,
            std_dev: f32::NAN,
        };

        assert!(model.init_params(rng, init).is_err());
    }

    #[test]
    fn wrong_parameter_count_is_rejected() {
        let mut model = Sequential::new(vec![2], [Layer::dense((2, 1), None)]);
        let res = model.forward(&[0.; 2], array![[1., 2.]].into_dyn());

        assert!(matches!(
            res,
            Err(MlErr::SizeMismatch {
                got: 2,
                expected: 3,
                ..
            })
        ));
    }

    #[test]
    fn wrong_sample_shape_is_rejected() {
        let mut model = Sequential::new(vec![3], [Layer::dense((3, 1), None)]);
        let res = model.forward(&[0.; 4], array![[1., 2.]].into_dyn());

        assert!(matches!(res, Err(MlErr::ShapeMismatch { .. })));
    }
}
