use std::{cell::RefCell, rc::Rc};

use comms::specs::model::{LossFnSpec, ModelSpec, OptimizerSpec};
use rand::{SeedableRng, rngs::StdRng};

use super::TrainingState;
use crate::{
    Result,
    arch::{
        ModelBuilder, Sequential,
        loss::{CrossEntropy, LossFn, Mse},
    },
    optimization::{Adam, GradientDescent, GradientDescentWithMomentum, Optimizer},
};

/// Builds `TrainingState`s given the specifications of their parts.
#[derive(Debug, Default)]
pub struct StateBuilder;

impl StateBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Builds a new `TrainingState` holding `params`.
    ///
    /// # Returns
    /// An error if the model is invalid or `params` does not fit it.
    pub fn build(
        &self,
        model: &ModelSpec,
        optimizer: OptimizerSpec,
        loss: LossFnSpec,
        params: Vec<f32>,
    ) -> Result<TrainingState> {
        let model = ModelBuilder::new().build(model)?;
        let optimizer = self.resolve_optimizer(optimizer, model.size());
        let loss = self.resolve_loss(loss);
        TrainingState::new(model, params, optimizer, loss)
    }

    /// Builds the model described by `spec` with freshly sampled parameters.
    ///
    /// # Returns
    /// The model and its initial parameters.
    pub fn init(&self, spec: &ModelSpec, seed: Option<u64>) -> Result<(Sequential, Vec<f32>)> {
        let ModelSpec::Sequential { init, .. } = spec;

        let model = ModelBuilder::new().build(spec)?;
        let rng = Rc::new(RefCell::new(self.generate_rng(seed)));
        let params = model.init_params(rng, *init)?;
        Ok((model, params))
    }

    pub fn resolve_optimizer(&self, spec: OptimizerSpec, len: usize) -> Box<dyn Optimizer + Send> {
        match spec {
            OptimizerSpec::GradientDescent { learning_rate } => {
                Box::new(GradientDescent::new(learning_rate))
            }
            OptimizerSpec::GradientDescentWithMomentum {
                learning_rate,
                momentum,
            } => Box::new(GradientDescentWithMomentum::new(len, learning_rate, momentum)),
            OptimizerSpec::Adam {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => Box::new(Adam::new(len, learning_rate, beta1, beta2, epsilon)),
        }
    }

    pub fn resolve_loss(&self, spec: LossFnSpec) -> Box<dyn LossFn + Send + Sync> {
        match spec {
            LossFnSpec::Mse => Box::new(Mse::new()),
            LossFnSpec::CrossEntropy => Box::new(CrossEntropy::new()),
        }
    }

    fn generate_rng(&self, seed: Option<u64>) -> StdRng {
        match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }
}
