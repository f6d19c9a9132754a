use comms::specs::model::{LossFnSpec, ModelSpec, OptimizerSpec};
use machine_learning::{
    arch::ModelBuilder,
    training::{StateBuilder, TrainingState},
};

use crate::{FederationErr, Result};

/// A model definition together with its current parameters and the way to train it.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInterface {
    spec: ModelSpec,
    params: Vec<f32>,
    optimizer: OptimizerSpec,
    loss: LossFnSpec,
}

impl ModelInterface {
    /// Creates a new `ModelInterface` with freshly initialized parameters.
    ///
    /// # Arguments
    /// * `spec` - The model's architecture.
    /// * `optimizer` - The optimizer collaborators train with.
    /// * `loss` - The loss collaborators minimize.
    /// * `seed` - Seeds the parameter initialization, `None` for a random one.
    pub fn new(
        spec: ModelSpec,
        optimizer: OptimizerSpec,
        loss: LossFnSpec,
        seed: Option<u64>,
    ) -> Result<Self> {
        let (_, params) = StateBuilder::new().init(&spec, seed)?;

        Ok(Self {
            spec,
            params,
            optimizer,
            loss,
        })
    }

    /// Creates a new `ModelInterface` holding already known parameters.
    ///
    /// # Returns
    /// An error if `params` does not fit `spec`.
    pub fn with_params(
        spec: ModelSpec,
        params: Vec<f32>,
        optimizer: OptimizerSpec,
        loss: LossFnSpec,
    ) -> Result<Self> {
        let expected = ModelBuilder::new().build(&spec)?.size();

        if params.len() != expected {
            return Err(FederationErr::ModelSizeMismatch {
                got: params.len(),
                expected,
            });
        }

        Ok(Self {
            spec,
            params,
            optimizer,
            loss,
        })
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub fn optimizer(&self) -> OptimizerSpec {
        self.optimizer
    }

    pub fn loss(&self) -> LossFnSpec {
        self.loss
    }

    /// The amount of parameters in the model.
    pub fn size(&self) -> usize {
        self.params.len()
    }

    pub fn set_params(&mut self, params: Vec<f32>) -> Result<()> {
        if params.len() != self.params.len() {
            return Err(FederationErr::ModelSizeMismatch {
                got: params.len(),
                expected: self.params.len(),
            });
        }

        self.params = params;
        Ok(())
    }

    /// Builds the mutable wrapper tasks train and evaluate through.
    pub fn training_state(&self) -> Result<TrainingState> {
        let state = StateBuilder::new().build(
            &self.spec,
            self.optimizer,
            self.loss,
            self.params.clone(),
        )?;

        Ok(state)
    }
}
