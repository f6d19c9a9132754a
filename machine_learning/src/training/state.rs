use log::debug;
use ndarray::{Array2, ArrayD, ArrayView1};

use super::{EpochStats, EvalStats};
use crate::{
    MlErr, Result,
    arch::{Sequential, loss::LossFn},
    dataset::DataLoader,
    optimization::Optimizer,
};

/// The mutable side of a model under training: its parameters together with the gradient
/// buffer, the optimizer state and the loss being minimized.
pub struct TrainingState {
    model: Sequential,
    params: Vec<f32>,
    grad: Vec<f32>,
    optimizer: Box<dyn Optimizer + Send>,
    loss: Box<dyn LossFn + Send + Sync>,
}

impl TrainingState {
    /// Creates a new `TrainingState`.
    ///
    /// # Returns
    /// An error if `params` does not fit `model`.
    pub fn new(
        model: Sequential,
        params: Vec<f32>,
        optimizer: Box<dyn Optimizer + Send>,
        loss: Box<dyn LossFn + Send + Sync>,
    ) -> Result<Self> {
        let size = model.size();

        if params.len() != size {
            return Err(MlErr::SizeMismatch {
                what: "parameters",
                got: params.len(),
                expected: size,
            });
        }

        Ok(Self {
            model,
            params,
            grad: vec![0.; size],
            optimizer,
            loss,
        })
    }

    pub fn model(&self) -> &Sequential {
        &self.model
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub fn into_params(self) -> Vec<f32> {
        self.params
    }

    /// Overwrites the parameters, keeping the optimizer state.
    pub fn set_params(&mut self, params: &[f32]) -> Result<()> {
        if params.len() != self.params.len() {
            return Err(MlErr::SizeMismatch {
                what: "parameters",
                got: params.len(),
                expected: self.params.len(),
            });
        }

        self.params.copy_from_slice(params);
        Ok(())
    }

    pub fn reset_optimizer(&mut self) {
        self.optimizer.reset();
    }

    /// Takes one optimizer step along a gradient computed elsewhere.
    pub fn apply_gradient(&mut self, grad: &[f32]) -> Result<()> {
        self.optimizer.update_params(&mut self.params, grad)
    }

    /// Runs one pass of mini batch gradient descent over `loader`.
    ///
    /// # Returns
    /// The mean loss of the pass, or `MlErr::EmptyDataset` if the loader yielded nothing.
    pub fn train_epoch(&mut self, loader: &mut DataLoader) -> Result<EpochStats> {
        let Self {
            model,
            params,
            grad,
            optimizer,
            loss,
        } = self;

        let mut stats = EpochStats::default();
        let mut total_loss = 0.;

        for batch in loader.batches() {
            let (x, y) = batch?;
            grad.fill(0.);

            let y_pred = model.forward(params, x)?;
            total_loss += loss.loss(y_pred.view(), y.view()) * y.nrows() as f32;

            let d = loss.loss_prime(y_pred.view(), y.view());
            model.backward(params, grad, d)?;
            optimizer.update_params(params, grad)?;

            stats.samples += y.nrows();
            stats.batches += 1;
        }

        if stats.samples == 0 {
            return Err(MlErr::EmptyDataset);
        }

        stats.loss = total_loss / stats.samples as f32;
        debug!(loss = stats.loss, samples = stats.samples; "finished training epoch");
        Ok(stats)
    }

    /// Measures the loss and accuracy of the current parameters over `loader`.
    pub fn evaluate(&mut self, loader: &mut DataLoader) -> Result<EvalStats> {
        let mut total_loss = 0.;
        let mut correct = 0;
        let mut samples = 0;

        for batch in loader.batches() {
            let (x, y) = batch?;
            let y_pred = self.model.forward(&self.params, x)?;

            total_loss += self.loss.loss(y_pred.view(), y.view()) * y.nrows() as f32;
            correct += y_pred
                .outer_iter()
                .zip(y.outer_iter())
                .filter(|(p, t)| argmax(*p) == argmax(*t))
                .count();
            samples += y.nrows();
        }

        if samples == 0 {
            return Err(MlErr::EmptyDataset);
        }

        let stats = EvalStats {
            loss: total_loss / samples as f32,
            accuracy: correct as f32 / samples as f32,
            samples,
        };

        debug!(loss = stats.loss, accuracy = stats.accuracy; "finished evaluation");
        Ok(stats)
    }

    /// Computes the model's raw output for a batch of samples.
    pub fn predict(&mut self, x: ArrayD<f32>) -> Result<Array2<f32>> {
        self.model.forward(&self.params, x)
    }
}

fn argmax(row: ArrayView1<f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
            if v > best.1 { (i, v) } else { best }
        })
        .0
}
